use crate::vault::normalize_link_key;
use crate::VaultPath;

/// A wikilink occurrence in a note body.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Outlink {
    /// Raw target text between the brackets, heading fragment stripped.
    pub target: String,
    /// Display alias from `[[target|display]]`.
    pub display: Option<String>,
    /// 1-based line of the opening brackets.
    pub line: u32,
}

impl Outlink {
    /// Lowercased, `.md`-stripped key this link files under.
    pub fn target_key(&self) -> String {
        normalize_link_key(&self.target)
    }
}

/// An inbound reference, filed under the raw target key so broken links
/// stay visible after their target disappears.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Backlink {
    pub source: VaultPath,
    pub target_key: String,
    pub line: u32,
}
