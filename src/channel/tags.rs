//! Secondary index from item tag to the sequence ids carrying it.

use std::collections::{BTreeSet, HashMap};

use crate::types::{Item, SequenceId};

#[derive(Debug, Default)]
pub struct TagIndex {
    by_tag: HashMap<String, BTreeSet<SequenceId>>,
}

impl TagIndex {
    pub fn insert(&mut self, item: &Item) {
        for tag in &item.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(item.sequence_id);
        }
    }

    pub fn remove(&mut self, item: &Item) {
        for tag in &item.tags {
            if let Some(ids) = self.by_tag.get_mut(tag) {
                ids.remove(&item.sequence_id);
                if ids.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }

    /// Ids carrying `tag`, ascending.
    pub fn lookup(&self, tag: &str) -> impl Iterator<Item = SequenceId> + '_ {
        self.by_tag.get(tag).into_iter().flatten().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelName;
    use chrono::Utc;

    fn item(seq: u64, tags: &[&str]) -> Item {
        Item {
            channel: ChannelName::new("c").unwrap(),
            sequence_id: SequenceId(seq),
            timestamp: Utc::now(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            content_type: None,
            payload: Vec::new(),
        }
    }

    #[test]
    fn lookup_is_ascending() {
        let mut index = TagIndex::default();
        index.insert(&item(3, &["a"]));
        index.insert(&item(1, &["a", "b"]));

        assert_eq!(index.lookup("a").collect::<Vec<_>>(), vec![SequenceId(1), SequenceId(3)]);
        assert_eq!(index.lookup("b").collect::<Vec<_>>(), vec![SequenceId(1)]);
        assert_eq!(index.lookup("zzz").count(), 0);
    }

    #[test]
    fn remove_drops_empty_tags() {
        let mut index = TagIndex::default();
        let first = item(1, &["a"]);
        index.insert(&first);
        index.remove(&first);

        assert_eq!(index.lookup("a").count(), 0);
        assert!(index.by_tag.is_empty());
    }
}
