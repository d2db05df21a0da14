//! Read access to PacBio dataset XML documents.
//!
//! Only the handful of facts the share service needs are extracted: the
//! dataset identity, the referenced files, the collection context (movie id),
//! the well sample and bio sample names, the DNA barcode and the child dataset
//! documents of a demultiplexed parent.

use std::fs;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::error::ShareError;

static RESOURCE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bResourceId="([^"]*)""#).unwrap());
static ROOT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\w+:)?\w*Set\b[^>]*>").unwrap());
static COLLECTION_METADATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\w+:)?CollectionMetadata\b[^>]*>").unwrap());
static WELL_SAMPLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\w+:)?WellSample\b[^>]*>").unwrap());
static BIO_SAMPLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\w+:)?BioSample\b[^>]*>").unwrap());
static DNA_BARCODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:\w+:)?DNABarcode\b[^>]*>").unwrap());
static EXTERNAL_RESOURCE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(/)?(?:\w+:)?ExternalResource\b([^>]*?)(/)?>").unwrap());
static ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\s([\w:]+)="([^"]*)""#).unwrap());
static SECTION_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:\w+:)?(ExternalResources|SupplementalResources|DataSetMetadata)\b").unwrap()
});

/// Facts extracted from one dataset document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetDocument {
    pub uuid: Option<String>,
    pub name: Option<String>,
    pub movie_id: Option<String>,
    pub well_sample_name: Option<String>,
    pub sample_name: Option<String>,
    pub barcode: Option<String>,
    /// Files under `ExternalResources`, nested indices and resources included.
    pub external_files: Vec<Utf8PathBuf>,
    /// Files under `SupplementalResources`.
    pub supplemental_files: Vec<Utf8PathBuf>,
    /// First XML document nested under each top-level external resource.
    /// For a parent these are its child datasets; other datasets ignore them.
    pub child_documents: Vec<Utf8PathBuf>,
}

impl DatasetDocument {
    pub fn movie_id(&self) -> Option<&str> {
        self.movie_id.as_deref()
    }

    pub fn sample_name(&self) -> Option<&str> {
        self.sample_name.as_deref()
    }

    pub fn well_sample_name(&self) -> Option<&str> {
        self.well_sample_name.as_deref()
    }

    pub fn barcode(&self) -> Option<&str> {
        self.barcode.as_deref()
    }

    pub fn file_paths(&self) -> &[Utf8PathBuf] {
        &self.external_files
    }

    pub fn child_documents(&self) -> &[Utf8PathBuf] {
        &self.child_documents
    }
}

pub trait DocumentReader: Send + Sync {
    fn read(&self, path: &Utf8Path) -> Result<DatasetDocument, ShareError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XmlDocumentReader;

impl DocumentReader for XmlDocumentReader {
    fn read(&self, path: &Utf8Path) -> Result<DatasetDocument, ShareError> {
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| ShareError::Document {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        let mut document = parse_document(&content).map_err(|message| ShareError::Document {
            path: path.to_string(),
            message,
        })?;
        if let Some(base) = path.parent() {
            document.resolve_relative(base);
        }
        Ok(document)
    }
}

impl DatasetDocument {
    /// Anchors relative resource ids at `base`, the directory of the document.
    pub fn resolve_relative(&mut self, base: &Utf8Path) {
        for path in self
            .external_files
            .iter_mut()
            .chain(self.supplemental_files.iter_mut())
            .chain(self.child_documents.iter_mut())
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

pub fn parse_document(xml: &str) -> Result<DatasetDocument, String> {
    let root = ROOT_TAG
        .find(xml)
        .ok_or_else(|| "no dataset element found".to_string())?
        .as_str();

    let sections = split_sections(xml);
    let metadata = sections.metadata;
    Ok(DatasetDocument {
        uuid: attribute(root, "UniqueId"),
        name: attribute(root, "Name"),
        movie_id: first_tag_attribute(&COLLECTION_METADATA, metadata, "Context"),
        well_sample_name: first_tag_attribute(&WELL_SAMPLE, metadata, "Name"),
        sample_name: first_tag_attribute(&BIO_SAMPLE, metadata, "Name"),
        barcode: first_tag_attribute(&DNA_BARCODE, metadata, "Name"),
        external_files: resource_ids(sections.external),
        supplemental_files: resource_ids(sections.supplemental),
        child_documents: nested_documents(sections.external),
    })
}

struct Sections<'a> {
    external: &'a str,
    supplemental: &'a str,
    metadata: &'a str,
}

/// Splits the document at its top-level section boundaries. Nested
/// `ExternalResources` inside the first one stay within the external slice.
fn split_sections(xml: &str) -> Sections<'_> {
    let mut external = None;
    let mut supplemental = None;
    let mut metadata = None;
    for capture in SECTION_START.captures_iter(xml) {
        let (Some(whole), Some(kind)) = (capture.get(0), capture.get(1)) else {
            continue;
        };
        match kind.as_str() {
            "ExternalResources" if external.is_none() => external = Some(whole.start()),
            "SupplementalResources" if supplemental.is_none() => {
                supplemental = Some(whole.start())
            }
            "DataSetMetadata" if metadata.is_none() => metadata = Some(whole.start()),
            _ => {}
        }
    }

    let bounds = [external, supplemental, metadata];
    Sections {
        external: section(xml, external, &bounds),
        supplemental: section(xml, supplemental, &bounds),
        metadata: metadata.map(|start| &xml[start..]).unwrap_or(""),
    }
}

fn section<'a>(xml: &'a str, start: Option<usize>, bounds: &[Option<usize>]) -> &'a str {
    let Some(start) = start else {
        return "";
    };
    let stop = bounds
        .iter()
        .flatten()
        .copied()
        .filter(|other| *other > start)
        .min()
        .unwrap_or(xml.len());
    &xml[start..stop]
}

fn resource_ids(section: &str) -> Vec<Utf8PathBuf> {
    let mut paths = Vec::new();
    for capture in RESOURCE_ID.captures_iter(section) {
        if let Some(value) = capture.get(1) {
            let path = Utf8PathBuf::from(unescape(value.as_str()));
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    paths
}

/// Walks the `ExternalResource` elements of `section`, tracking their depth,
/// and keeps the first `.xml` resource found below each top-level one.
fn nested_documents(section: &str) -> Vec<Utf8PathBuf> {
    let mut documents = Vec::new();
    let mut depth = 0usize;
    let mut found_in_current = false;
    for capture in EXTERNAL_RESOURCE_TAG.captures_iter(section) {
        if capture.get(1).is_some() {
            depth = depth.saturating_sub(1);
            continue;
        }
        let attributes = capture.get(2).map_or("", |value| value.as_str());
        if depth == 0 {
            found_in_current = false;
        } else if !found_in_current {
            if let Some(path) = attribute(attributes, "ResourceId")
                .map(Utf8PathBuf::from)
                .filter(|path| path.extension() == Some("xml"))
            {
                documents.push(path);
                found_in_current = true;
            }
        }
        if capture.get(3).is_none() {
            depth += 1;
        }
    }
    documents
}

fn first_tag_attribute(tag: &Regex, text: &str, name: &str) -> Option<String> {
    tag.find(text).and_then(|found| attribute(found.as_str(), name))
}

fn attribute(tag: &str, name: &str) -> Option<String> {
    ATTRIBUTE
        .captures_iter(tag)
        .find(|capture| capture.get(1).is_some_and(|key| key.as_str() == name))
        .and_then(|capture| capture.get(2))
        .map(|value| unescape(value.as_str()))
        .filter(|value| !value.is_empty())
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBREAD_SET: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<pbds:ConsensusReadSet xmlns:pbds="http://pacificbiosciences.com/PacBioDatasets.xsd" UniqueId="5c1f3a4e-1111-4a2b-8c3d-9e8f7a6b5c4d" Name="Run 7 &amp; friends" MetaType="PacBio.DataSet.ConsensusReadSet">
  <pbbase:ExternalResources>
    <pbbase:ExternalResource ResourceId="/data/r7/m84001_240501.hifi_reads.bam" MetaType="PacBio.ConsensusReadFile.ConsensusReadBamFile">
      <pbbase:FileIndices>
        <pbbase:FileIndex ResourceId="/data/r7/m84001_240501.hifi_reads.bam.pbi"/>
      </pbbase:FileIndices>
    </pbbase:ExternalResource>
  </pbbase:ExternalResources>
  <pbds:SupplementalResources>
    <pbbase:ExternalResource ResourceId="/data/r7/m84001_240501.sts.xml.gz"/>
  </pbds:SupplementalResources>
  <pbds:DataSetMetadata>
    <pbmeta:Collections>
      <pbmeta:CollectionMetadata UniqueId="x" Context="m84001_240501" InstrumentName="Revio">
        <pbmeta:WellSample Name="Plate 1 Well A01" WellName="A01">
          <pbsample:BioSamples>
            <pbsample:BioSample Name="Leaf sample">
              <pbsample:DNABarcodes>
                <pbsample:DNABarcode Name="bc2001--bc2001" UniqueId="y"/>
              </pbsample:DNABarcodes>
            </pbsample:BioSample>
          </pbsample:BioSamples>
        </pbmeta:WellSample>
      </pbmeta:CollectionMetadata>
    </pbmeta:Collections>
  </pbds:DataSetMetadata>
</pbds:ConsensusReadSet>"#;

    #[test]
    fn extracts_metadata_and_files() {
        let doc = parse_document(SUBREAD_SET).unwrap();
        assert_eq!(
            doc.uuid.as_deref(),
            Some("5c1f3a4e-1111-4a2b-8c3d-9e8f7a6b5c4d")
        );
        assert_eq!(doc.name.as_deref(), Some("Run 7 & friends"));
        assert_eq!(doc.movie_id(), Some("m84001_240501"));
        assert_eq!(doc.well_sample_name(), Some("Plate 1 Well A01"));
        assert_eq!(doc.sample_name(), Some("Leaf sample"));
        assert_eq!(doc.barcode(), Some("bc2001--bc2001"));
        assert_eq!(
            doc.external_files,
            vec![
                Utf8PathBuf::from("/data/r7/m84001_240501.hifi_reads.bam"),
                Utf8PathBuf::from("/data/r7/m84001_240501.hifi_reads.bam.pbi"),
            ]
        );
        assert_eq!(
            doc.supplemental_files,
            vec![Utf8PathBuf::from("/data/r7/m84001_240501.sts.xml.gz")]
        );
        assert!(doc.child_documents.is_empty());
    }

    #[test]
    fn missing_metadata_is_none() {
        let doc = parse_document(
            r#"<pbds:SubreadSet UniqueId="u" Name="bare"><pbbase:ExternalResources/></pbds:SubreadSet>"#,
        )
        .unwrap();
        assert_eq!(doc.movie_id(), None);
        assert_eq!(doc.barcode(), None);
        assert_eq!(doc.sample_name(), None);
    }

    #[test]
    fn parent_lists_child_documents() {
        let xml = r#"<pbds:ConsensusReadSet UniqueId="p" Name="parent">
  <pbbase:ExternalResources>
    <pbbase:ExternalResource ResourceId="/data/demux/bc1001.bam">
      <pbbase:ExternalResources>
        <pbbase:ExternalResource ResourceId="/data/demux/bc1001.consensusreadset.xml"/>
      </pbbase:ExternalResources>
    </pbbase:ExternalResource>
    <pbbase:ExternalResource ResourceId="/data/demux/bc1002.bam">
      <pbbase:ExternalResources>
        <pbbase:ExternalResource ResourceId="/data/demux/bc1002.consensusreadset.xml"/>
      </pbbase:ExternalResources>
    </pbbase:ExternalResource>
  </pbbase:ExternalResources>
</pbds:ConsensusReadSet>"#;
        let doc = parse_document(xml).unwrap();
        assert_eq!(
            doc.child_documents(),
            &[
                Utf8PathBuf::from("/data/demux/bc1001.consensusreadset.xml"),
                Utf8PathBuf::from("/data/demux/bc1002.consensusreadset.xml"),
            ]
        );
        assert_eq!(doc.external_files.len(), 4);
    }

    #[test]
    fn nested_xml_stays_in_file_list() {
        let xml = r#"<pbds:SubreadSet UniqueId="s" Name="run">
  <pbbase:ExternalResources>
    <pbbase:ExternalResource ResourceId="/d/m54.subreads.bam">
      <pbbase:ExternalResources>
        <pbbase:ExternalResource ResourceId="/d/m54.scraps.bam"/>
        <pbbase:ExternalResource ResourceId="/d/m54.sts.xml"/>
      </pbbase:ExternalResources>
    </pbbase:ExternalResource>
  </pbbase:ExternalResources>
</pbds:SubreadSet>"#;
        let doc = parse_document(xml).unwrap();
        assert_eq!(
            doc.file_paths(),
            &[
                Utf8PathBuf::from("/d/m54.subreads.bam"),
                Utf8PathBuf::from("/d/m54.scraps.bam"),
                Utf8PathBuf::from("/d/m54.sts.xml"),
            ]
        );
    }

    #[test]
    fn rejects_non_dataset_document() {
        assert!(parse_document("<html></html>").is_err());
    }
}
