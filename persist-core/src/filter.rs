/*!
Key filtering from whitelist/blacklist configuration.
*/

use std::collections::HashSet;

/// Pure key predicate built from an optional whitelist and a blacklist.
///
/// A key is allowed when the whitelist is absent or contains it, and the
/// blacklist does not contain it. The blacklist always wins, even over a
/// whitelisted key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    whitelist: Option<HashSet<String>>,
    blacklist: HashSet<String>,
}

impl KeyFilter {
    /// Create a filter from an optional whitelist and a blacklist
    pub fn new<W, B, S>(whitelist: Option<W>, blacklist: B) -> Self
    where
        W: IntoIterator<Item = S>,
        B: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            whitelist: whitelist.map(|keys| keys.into_iter().map(Into::into).collect()),
            blacklist: blacklist.into_iter().map(Into::into).collect(),
        }
    }

    /// A filter that lets every key through
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Returns true if `key` may be persisted
    pub fn allows(&self, key: &str) -> bool {
        if let Some(whitelist) = &self.whitelist {
            if !whitelist.contains(key) {
                return false;
            }
        }
        !self.blacklist.contains(key)
    }

    pub fn whitelist(&self) -> Option<&HashSet<String>> {
        self.whitelist.as_ref()
    }

    pub fn blacklist(&self) -> &HashSet<String> {
        &self.blacklist
    }
}
