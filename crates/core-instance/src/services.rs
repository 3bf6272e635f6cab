//! Capability seams for the annotation, search, and download
//! collaborators. The core consumes these narrow traits and never depends
//! on the collaborators' internals; the no-op implementations keep a
//! viewer fully functional without them.

use core_provider::DocumentSource;

/// Annotation authoring backend. Implementations own storage and hit
/// testing; the instance facade wraps calls with the matching bus events.
pub trait AnnotationService: Send + Sync {
    /// Create an annotation, returning its id.
    fn create(&self, page: u32, kind: &str) -> String;
    fn update(&self, annotation_id: &str) -> bool;
    fn delete(&self, annotation_id: &str) -> bool;
    fn select(&self, annotation_id: &str) -> bool;
}

/// Stateless default: ids are synthesized, mutations accepted.
#[derive(Debug, Default)]
pub struct NoopAnnotations;

impl AnnotationService for NoopAnnotations {
    fn create(&self, page: u32, kind: &str) -> String {
        format!("{kind}-{page}")
    }

    fn update(&self, _annotation_id: &str) -> bool {
        true
    }

    fn delete(&self, _annotation_id: &str) -> bool {
        true
    }

    fn select(&self, _annotation_id: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchMatch {
    pub page: u32,
    pub snippet: String,
}

pub trait SearchService: Send + Sync {
    fn search(&self, query: &str) -> Vec<SearchMatch>;
    fn clear(&self);
}

#[derive(Debug, Default)]
pub struct NoopSearch;

impl SearchService for NoopSearch {
    fn search(&self, _query: &str) -> Vec<SearchMatch> {
        Vec::new()
    }

    fn clear(&self) {}
}

pub trait DownloadService: Send + Sync {
    /// Hand the document bytes (or their location) to the host download
    /// pipeline. Returns whether the request was accepted.
    fn request_download(&self, source: &DocumentSource, suggested_name: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct NoopDownload;

impl DownloadService for NoopDownload {
    fn request_download(&self, _source: &DocumentSource, _suggested_name: &str) -> bool {
        false
    }
}
