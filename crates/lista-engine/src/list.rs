//! The materialized list.

use crate::ops::{ListItem, Operation};
use std::collections::HashSet;

/// Effect of folding one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome {
    Added(ListItem),
    /// Carries the payload even when no item matched
    Updated(ListItem),
    Deleted(ListItem),
    Replaced(Vec<ListItem>),
    /// Membership and unknown operations do not touch the list
    Skipped,
}

/// Current list view, newest first. At most one item per `text`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterializedList {
    items: Vec<ListItem>,
}

impl MaterializedList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Items in display order.
    pub fn items(&self) -> &[ListItem] {
        &self.items
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if there are no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Find an item by text.
    pub fn get(&self, text: &str) -> Option<&ListItem> {
        self.items.iter().find(|i| i.text == text)
    }

    /// Remove every item.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Fold one operation.
    pub fn fold(&mut self, op: &Operation) -> FoldOutcome {
        match op {
            Operation::Add(item) => {
                self.items.retain(|i| i.text != item.text);
                self.items.insert(0, item.clone());
                FoldOutcome::Added(item.clone())
            }
            Operation::Update(item) => {
                if let Some(existing) = self.items.iter_mut().find(|i| i.text == item.text) {
                    *existing = item.clone();
                }
                FoldOutcome::Updated(item.clone())
            }
            Operation::Delete(item) => {
                self.items.retain(|i| i.text != item.text);
                FoldOutcome::Deleted(item.clone())
            }
            Operation::List(items) => {
                self.replace(items.clone());
                FoldOutcome::Replaced(self.items.clone())
            }
            Operation::AddWriter(_) | Operation::Unknown(_) => FoldOutcome::Skipped,
        }
    }

    /// Replace the whole list, keeping the first item of each text.
    pub fn replace(&mut self, items: Vec<ListItem>) {
        let mut seen = HashSet::new();
        self.items = items
            .into_iter()
            .filter(|i| seen.insert(i.text.clone()))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn item(text: &str, done: bool) -> ListItem {
        ListItem {
            id: String::new(),
            text: text.to_string(),
            is_done: done,
            list_id: None,
            time_of_completion: 0,
            updated_at: 0,
            timestamp: 0,
        }
    }

    #[test]
    fn add_prepends_and_dedupes() {
        let mut list = MaterializedList::new();
        list.fold(&Operation::Add(item("a", false)));
        list.fold(&Operation::Add(item("b", false)));
        list.fold(&Operation::Add(item("a", true)));

        let texts: Vec<_> = list.items().iter().map(|i| i.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert!(list.get("a").unwrap().is_done);
    }

    #[test]
    fn update_keeps_position_and_never_inserts() {
        let mut list = MaterializedList::new();
        list.fold(&Operation::Add(item("a", false)));
        list.fold(&Operation::Add(item("b", false)));

        let outcome = list.fold(&Operation::Update(item("a", true)));
        assert_eq!(outcome, FoldOutcome::Updated(item("a", true)));
        assert_eq!(list.items()[1], item("a", true));

        list.fold(&Operation::Update(item("zzz", true)));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn delete_missing_is_noop() {
        let mut list = MaterializedList::new();
        list.fold(&Operation::Add(item("a", false)));
        list.fold(&Operation::Delete(item("b", false)));
        assert_eq!(list.len(), 1);
        list.fold(&Operation::Delete(item("a", false)));
        assert!(list.is_empty());
    }

    #[test]
    fn replace_dedupes() {
        let mut list = MaterializedList::new();
        list.fold(&Operation::List(vec![
            item("a", false),
            item("a", true),
            item("b", false),
        ]));
        assert_eq!(list.len(), 2);
        assert!(!list.get("a").unwrap().is_done);
    }

    fn arb_op() -> impl Strategy<Value = Operation> {
        let text = prop::sample::select(vec!["milk", "eggs", "bread", "tea"]);
        (0u8..4, text, any::<bool>()).prop_map(|(kind, text, done)| match kind {
            0 => Operation::Add(item(text, done)),
            1 => Operation::Update(item(text, done)),
            2 => Operation::Delete(item(text, done)),
            _ => Operation::List(vec![item(text, done), item("milk", !done)]),
        })
    }

    proptest! {
        #[test]
        fn texts_stay_unique(ops in prop::collection::vec(arb_op(), 0..64)) {
            let mut list = MaterializedList::new();
            for op in &ops {
                list.fold(op);
                let mut seen = HashSet::new();
                for i in list.items() {
                    prop_assert!(seen.insert(i.text.clone()));
                }
            }
        }

        #[test]
        fn fold_is_deterministic(ops in prop::collection::vec(arb_op(), 0..64)) {
            let mut first = MaterializedList::new();
            let mut second = MaterializedList::new();
            for op in &ops {
                first.fold(op);
            }
            for op in &ops {
                second.fold(op);
            }
            prop_assert_eq!(first, second);
        }
    }
}
