use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::error;

use crate::document::{DatasetDocument, DocumentReader};
use crate::domain::{DatasetDescription, DatasetUuid, JobId};
use crate::error::ShareError;

/// Placeholder used in directory names when a metadata field is absent.
pub const UNKNOWN: &str = "unknown";
pub const SUPPLEMENTAL_DIR_NAME: &str = "Supplemental Run Data";

/// A set of files staged together into one directory, relative to the staging root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCollection {
    pub dir_path: Utf8PathBuf,
    pub files: Vec<Utf8PathBuf>,
}

impl FileCollection {
    pub fn new(dir_path: impl Into<Utf8PathBuf>, files: Vec<Utf8PathBuf>) -> Self {
        Self {
            dir_path: dir_path.into(),
            files,
        }
    }

    /// Output files of an analysis job, nested under the dataset it analysed.
    pub fn analysis(dataset_dir: &Utf8Path, job_id: JobId, job_name: &str, files: Vec<Utf8PathBuf>) -> Self {
        Self::new(
            dataset_dir.join(format!("Analysis {job_id}: {job_name}")),
            files,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Standalone,
    Parent,
    /// Demultiplexed child whose parent is part of the same project; the
    /// parent stages it.
    Child,
}

/// Decides how a dataset in a project is handled. A child is only a child if
/// its parent is present in `project_datasets`.
pub fn classify(
    description: &DatasetDescription,
    project_datasets: &HashSet<DatasetUuid>,
) -> DatasetKind {
    if description.num_children > 0 {
        return DatasetKind::Parent;
    }
    match &description.parent_uuid {
        Some(parent) if project_datasets.contains(parent) => DatasetKind::Child,
        _ => DatasetKind::Standalone,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dataset {
    Standalone(Standalone),
    Parent(Parent),
}

impl Dataset {
    /// Reads the dataset's document and builds the matching variant. A broken
    /// document is an error for this dataset only; broken child documents of
    /// a parent are logged and skipped.
    pub fn resolve<D: DocumentReader + ?Sized>(
        description: &DatasetDescription,
        documents: &D,
    ) -> Result<Self, ShareError> {
        let document = documents.read(&description.path)?;
        if description.num_children > 0 {
            Ok(Dataset::Parent(Parent::from_document(
                description,
                &document,
                documents,
            )))
        } else {
            Ok(Dataset::Standalone(Standalone::from_document(
                description,
                &document,
            )))
        }
    }

    pub fn uuid(&self) -> &DatasetUuid {
        match self {
            Dataset::Standalone(dataset) => &dataset.uuid,
            Dataset::Parent(parent) => &parent.uuid,
        }
    }

    pub fn dir_path(&self) -> Utf8PathBuf {
        match self {
            Dataset::Standalone(dataset) => dataset.dir_path(),
            Dataset::Parent(parent) => parent.dir_path(),
        }
    }

    pub fn collection(&self) -> FileCollection {
        match self {
            Dataset::Standalone(dataset) => FileCollection::new(dataset.dir_path(), dataset.files.clone()),
            Dataset::Parent(parent) => FileCollection::new(parent.dir_path(), Vec::new()),
        }
    }

    pub fn children(&self) -> &[Child] {
        match self {
            Dataset::Standalone(_) => &[],
            Dataset::Parent(parent) => &parent.children,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Standalone {
    pub uuid: DatasetUuid,
    pub name: String,
    pub movie_id: Option<String>,
    pub files: Vec<Utf8PathBuf>,
}

impl Standalone {
    fn from_document(description: &DatasetDescription, document: &DatasetDocument) -> Self {
        // Orphaned children keep their BioSample name rather than the
        // demultiplexer's generated dataset name.
        let name = match (&description.parent_uuid, document.sample_name()) {
            (Some(_), Some(sample)) => sample.to_string(),
            _ => description.name.clone(),
        };
        Self {
            uuid: description.uuid.clone(),
            name,
            movie_id: document.movie_id.clone(),
            files: document.file_paths().to_vec(),
        }
    }

    pub fn dir_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "Movie {} - {}",
            self.movie_id.as_deref().unwrap_or(UNKNOWN),
            self.name
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parent {
    pub uuid: DatasetUuid,
    pub well_sample_name: String,
    pub movie_id: Option<String>,
    pub child_count: u32,
    pub children: Vec<Child>,
}

impl Parent {
    fn from_document<D: DocumentReader + ?Sized>(
        description: &DatasetDescription,
        document: &DatasetDocument,
        documents: &D,
    ) -> Self {
        let mut parent = Self {
            uuid: description.uuid.clone(),
            well_sample_name: document
                .well_sample_name()
                .unwrap_or(&description.name)
                .to_string(),
            movie_id: document.movie_id.clone(),
            child_count: description.num_children,
            children: Vec::new(),
        };
        let parent_dir = parent.dir_path();

        for path in document.child_documents() {
            match documents.read(path) {
                Ok(child_document) => parent
                    .children
                    .push(Child::sample(&parent_dir, &child_document)),
                Err(err) => {
                    error!(dataset = %parent.uuid, child = %path, "skipping child dataset: {err}");
                }
            }
        }
        parent.children.push(Child::supplemental(
            &parent_dir,
            document.supplemental_files.clone(),
        ));
        parent
    }

    pub fn dir_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "Movie {} - {} ({} barcoded samples)",
            self.movie_id.as_deref().unwrap_or(UNKNOWN),
            self.well_sample_name,
            self.child_count
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildKind {
    Sample {
        uuid: Option<String>,
        sample_name: String,
        barcode: String,
    },
    /// The parent's own run data that belongs to no barcode.
    Supplemental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Child {
    pub parent_dir: Utf8PathBuf,
    pub kind: ChildKind,
    pub files: Vec<Utf8PathBuf>,
}

impl Child {
    fn sample(parent_dir: &Utf8Path, document: &DatasetDocument) -> Self {
        let sample_name = document
            .sample_name()
            .or(document.name.as_deref())
            .unwrap_or(UNKNOWN)
            .to_string();
        Self {
            parent_dir: parent_dir.to_path_buf(),
            kind: ChildKind::Sample {
                uuid: document.uuid.clone(),
                sample_name,
                barcode: document.barcode().unwrap_or(UNKNOWN).to_string(),
            },
            files: document.file_paths().to_vec(),
        }
    }

    fn supplemental(parent_dir: &Utf8Path, files: Vec<Utf8PathBuf>) -> Self {
        Self {
            parent_dir: parent_dir.to_path_buf(),
            kind: ChildKind::Supplemental,
            files,
        }
    }

    pub fn dir_name(&self) -> String {
        match &self.kind {
            ChildKind::Sample {
                sample_name,
                barcode,
                ..
            } => format!("{sample_name} ({barcode})"),
            ChildKind::Supplemental => SUPPLEMENTAL_DIR_NAME.to_string(),
        }
    }

    pub fn dir_path(&self) -> Utf8PathBuf {
        self.parent_dir.join(self.dir_name())
    }

    pub fn collection(&self) -> FileCollection {
        FileCollection::new(self.dir_path(), self.files.clone())
    }
}
