use std::io::{self, Write};

use serde::Serialize;

use crate::engine::{AnalysisReport, ReconcileReport};

#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub expired_removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub notification: String,
}

/// Renders command results as pretty JSON on stdout; logs go to stderr.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_reconcile(result: &ReconcileReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_analyses(result: &AnalysisReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_sweep(result: &SweepResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_dispatch(result: &DispatchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let mut stdout = io::stdout();
        Self::write_json(&mut stdout, value)
    }

    pub fn write_json<W: Write, T: Serialize>(writer: &mut W, value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        writer.write_all(json.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProjectId;

    #[test]
    fn report_renders_as_json_object() {
        let report = ReconcileReport {
            project_id: Some(ProjectId::new(4)),
            datasets_added: 1,
            grants_created: 2,
            ..ReconcileReport::default()
        };
        let mut buffer = Vec::new();
        JsonOutput::write_json(&mut buffer, &report).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(value["project_id"], 4);
        assert_eq!(value["datasets_added"], 1);
        assert_eq!(value["grants_created"], 2);
        assert!(buffer.ends_with(b"\n"));
    }
}
