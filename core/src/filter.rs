/// Subscription filters (`{ids?, authors?, kinds?, #x?, limit?}`)
use crate::event::{Event, Kind};
use crate::identity::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<PublicKey>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<Kind>>,

    /// Tag filters keyed `#<letter>`
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = PublicKey>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn tag<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.insert(
            format!("#{}", letter),
            values.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// `#p` filter over public keys
    pub fn pubkeys(self, pubkeys: impl IntoIterator<Item = PublicKey>) -> Self {
        self.tag('p', pubkeys.into_iter().map(|pk| pk.to_hex()))
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn tag_values(&self, letter: char) -> Option<&[String]> {
        self.tags.get(&format!("#{}", letter)).map(Vec::as_slice)
    }

    /// Evaluate the predicate locally; `limit` only applies relay-side
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            let id = event.id.to_hex();
            if !ids.iter().any(|candidate| *candidate == id) {
                return false;
            }
        }

        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }

        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        self.tags.iter().all(|(key, wanted)| {
            let letter = key.trim_start_matches('#');
            event
                .tag_values(letter)
                .any(|value| wanted.iter().any(|w| w == value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, Tag};
    use crate::identity::Keys;

    #[test]
    fn test_filter_wire_shape() {
        let filter = Filter::new()
            .kinds([Kind::ChannelMessage])
            .tag('e', ["chan"])
            .limit(32);

        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value["kinds"], serde_json::json!([42]));
        assert_eq!(value["#e"], serde_json::json!(["chan"]));
        assert_eq!(value["limit"], 32);
        assert!(value.get("ids").is_none());
        assert!(value.get("authors").is_none());
    }

    #[test]
    fn test_filter_matches() {
        let keys = Keys::generate();
        let other = Keys::generate();
        let event = EventBuilder::new(Kind::ChannelMessage, "hi")
            .tag(Tag::event("chan"))
            .sign(&keys)
            .unwrap();

        assert!(Filter::new().matches(&event));
        assert!(Filter::new()
            .kinds([Kind::ChannelMessage])
            .tag('e', ["chan"])
            .matches(&event));
        assert!(!Filter::new().tag('e', ["other"]).matches(&event));
        assert!(!Filter::new().kinds([Kind::ChannelCreation]).matches(&event));
        assert!(Filter::new().authors([keys.public_key()]).matches(&event));
        assert!(!Filter::new().authors([other.public_key()]).matches(&event));
        assert!(Filter::new().ids([event.id.to_hex()]).matches(&event));
        assert!(!Filter::new().ids(["nope"]).matches(&event));
    }
}
