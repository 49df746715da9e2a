use serde_json::Value;

use super::intervals::Interval;

/// One page of raw entries from a paginated source.
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    /// Raw entries, newest first.
    pub entries: Vec<Value>,
    /// Total number of pages for this span and page size. Zero when the
    /// span holds no entries.
    pub total_pages: u32,
}

/// A paginated source of time-stamped records for a subject.
///
/// The concrete HTTP implementation lives in `crate::lastfm`.
#[async_trait::async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch page `page_number` (1-based) of the entries inside `span`.
    async fn fetch_page(
        &self,
        subject: &str,
        span: Interval,
        page_size: u32,
        page_number: u32,
    ) -> anyhow::Result<SourcePage>;
}
