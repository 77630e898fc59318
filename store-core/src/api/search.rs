//! `Search` request shaping for `GET v2/snaps/find` (spec.md §4.5).

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

use crate::error::{StoreError, StoreResult};

lazy_static! {
    /// Characters that are never legal in a free-text search query
    /// (spec.md §8, testable property #6).
    static ref DENYLIST: Regex = Regex::new(r#"[+=&|><!(){}\[\]^"~*?:\\/]"#).unwrap();
}

/// The caller-facing search request. Maps onto query parameters the way
/// spec.md §4.5 describes.
#[derive(Debug, Clone, Default)]
pub struct Search {
    pub query: Option<String>,
    pub name_prefix: bool,
    pub common_id: Option<String>,
    pub private: bool,
    pub category: Option<String>,
    pub scope: Option<String>,
}

impl Search {
    /// Validates the query against the denylist and the scope policy
    /// (spec.md §8, testable properties #6 and #7), without making any
    /// network call.
    pub fn validate(&self) -> StoreResult<()> {
        if let Some(query) = &self.query {
            if DENYLIST.is_match(query) {
                return Err(StoreError::BadQuery);
            }
        }

        match self.scope.as_deref() {
            None | Some("wide") => {}
            Some(other) => return Err(StoreError::InvalidScope(other.to_owned())),
        }

        Ok(())
    }

    /// Builds the `(key, value)` query parameters for the v2 endpoint.
    pub fn to_v2_params(&self, classic: bool) -> Vec<(&'static str, String)> {
        let mut params = self.common_params(classic);

        if let Some(common_id) = &self.common_id {
            params.push(("common-id", common_id.clone()));
        }
        if let Some(category) = &self.category {
            params.push(("category", category.clone()));
        }

        params
    }

    /// Builds the v1 fallback parameters (spec.md §4.5, testable property
    /// S5): `section` replaces `category`, `common_id` replaces
    /// `common-id`.
    pub fn to_v1_params(&self, classic: bool) -> Vec<(&'static str, String)> {
        let mut params = self.common_params(classic);

        if let Some(common_id) = &self.common_id {
            params.push(("common_id", common_id.clone()));
        }
        if let Some(category) = &self.category {
            params.push(("section", category.clone()));
        }

        params
    }

    fn common_params(&self, classic: bool) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();

        if let Some(query) = &self.query {
            if self.name_prefix {
                params.push(("name", query.clone()));
            } else {
                params.push(("q", query.clone()));
            }
        }

        if self.private {
            params.push(("private", "true".to_owned()));
        }

        if self.scope.is_none() {
            params.push(("channel", "stable".to_owned()));
        }

        let confinement = if classic { "strict,classic" } else { "strict" };
        params.push(("confinement", confinement.to_owned()));

        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denylist_rejects_without_network_call() {
        for bad in ["a+b", "a=b", "a&b", "a|b", "a(b)", "a[b]", "a{b}", "a^b", "a\"b", "a~b", "a*b", "a?b", "a:b", "a\\b", "a/b", "a>b", "a<b", "a!b"] {
            let search = Search {
                query: Some(bad.to_owned()),
                ..Default::default()
            };
            assert!(matches!(search.validate(), Err(StoreError::BadQuery)), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn allows_clean_queries() {
        let search = Search {
            query: Some("hello-world_2".to_owned()),
            ..Default::default()
        };
        assert!(search.validate().is_ok());
    }

    #[test]
    fn empty_scope_sets_stable_channel() {
        let search = Search::default();
        let params = search.to_v2_params(false);
        assert!(params.contains(&("channel", "stable".to_owned())));
    }

    #[test]
    fn wide_scope_omits_channel_restriction() {
        let search = Search {
            scope: Some("wide".to_owned()),
            ..Default::default()
        };
        assert!(search.validate().is_ok());
        let params = search.to_v2_params(false);
        assert!(!params.iter().any(|(k, _)| *k == "channel"));
    }

    #[test]
    fn other_scope_is_rejected() {
        let search = Search {
            scope: Some("narrow".to_owned()),
            ..Default::default()
        };
        assert!(matches!(search.validate(), Err(StoreError::InvalidScope(_))));
    }

    #[test]
    fn classic_systems_widen_confinement() {
        let search = Search::default();
        let params = search.to_v2_params(true);
        assert!(params.contains(&("confinement", "strict,classic".to_owned())));
    }

    #[test]
    fn v1_fallback_renames_category_and_common_id() {
        let search = Search {
            common_id: Some("org.example.app".to_owned()),
            category: Some("games".to_owned()),
            ..Default::default()
        };
        let v1 = search.to_v1_params(false);
        assert!(v1.contains(&("common_id", "org.example.app".to_owned())));
        assert!(v1.contains(&("section", "games".to_owned())));

        let v2 = search.to_v2_params(false);
        assert!(v2.contains(&("common-id", "org.example.app".to_owned())));
        assert!(v2.contains(&("category", "games".to_owned())));
    }
}
