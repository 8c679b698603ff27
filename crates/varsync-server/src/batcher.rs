//! Priority ordering and coalescing for one destination.

use std::collections::HashMap;

use varsync_core::priority::split_priority;
use varsync_core::{Message, Priority, VarId};

struct Entry {
    priority: Priority,
    message: Message,
}

/// Accumulates messages for one destination until flushed.
///
/// Updates to the same variable at the same priority merge into the first
/// one queued: the latest value wins and properties accumulate. An update
/// whose property keys span priorities is split so each key travels in its
/// own bucket, with the priority suffix stripped from its key; the value
/// stays in the bucket of the message's own priority.
/// A destroy drops anything still queued for that variable.
#[derive(Default)]
pub struct MessageBatcher {
    slots: Vec<Option<Entry>>,
    updates: HashMap<(VarId, Priority), usize>,
}

impl MessageBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: Priority, message: Message) {
        match message {
            Message::Update(update) if !update.properties.is_empty() => {
                let mut buckets: Vec<(Priority, varsync_core::message::Properties)> = Vec::new();
                for (key, value) in update.properties {
                    let (name, p) = split_priority(&key);
                    let name = name.to_string();
                    match buckets.iter_mut().find(|(bp, _)| *bp == p) {
                        Some((_, props)) => {
                            props.insert(name, value);
                        }
                        None => buckets.push((p, [(name, value)].into_iter().collect())),
                    }
                }
                buckets.sort_by_key(|(p, _)| *p);
                let mut value = update.value;
                if value.is_some() && !buckets.iter().any(|(p, _)| *p == priority) {
                    buckets.push((priority, Default::default()));
                }
                for (p, props) in buckets {
                    let carried = if p == priority { value.take() } else { None };
                    self.push_update(p, Message::update(update.var_id, carried, props));
                }
            }
            Message::Update(_) => self.push_update(priority, message),
            Message::Destroy(ref destroy) => {
                let var = destroy.var_id;
                let stale: Vec<usize> = self
                    .updates
                    .iter()
                    .filter(|((v, _), _)| *v == var)
                    .map(|(_, idx)| *idx)
                    .collect();
                for idx in stale {
                    self.slots[idx] = None;
                }
                self.updates.retain(|(v, _), _| *v != var);
                self.slots.push(Some(Entry { priority, message }));
            }
            other => self.slots.push(Some(Entry {
                priority,
                message: other,
            })),
        }
    }

    fn push_update(&mut self, priority: Priority, message: Message) {
        let Message::Update(incoming) = message else {
            return;
        };
        let key = (incoming.var_id, priority);
        if let Some(&idx) = self.updates.get(&key) {
            if let Some(Entry {
                message: Message::Update(queued),
                ..
            }) = self.slots[idx].as_mut()
            {
                if incoming.value.is_some() {
                    queued.value = incoming.value;
                }
                queued.properties.extend(incoming.properties);
                return;
            }
        }
        self.updates.insert(key, self.slots.len());
        self.slots.push(Some(Entry {
            priority,
            message: Message::Update(incoming),
        }));
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Everything queued, high before medium before low, first-in-first-out
    /// within a priority.
    pub fn flush(&mut self) -> Vec<Message> {
        self.updates.clear();
        let mut entries: Vec<Entry> = self.slots.drain(..).flatten().collect();
        entries.sort_by_key(|e| e.priority);
        entries.into_iter().map(|e| e.message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use varsync_core::message::Properties;

    fn props(pairs: &[(&str, &str)]) -> Properties {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn flush_orders_by_priority_stably() {
        let mut batcher = MessageBatcher::new();
        batcher.push(Priority::Low, Message::watch(VarId(1)));
        batcher.push(Priority::High, Message::watch(VarId(2)));
        batcher.push(Priority::Medium, Message::watch(VarId(3)));
        batcher.push(Priority::High, Message::watch(VarId(4)));

        let ids: Vec<i64> = batcher
            .flush()
            .iter()
            .filter_map(|m| m.var_id().map(|v| v.0))
            .collect();
        assert_eq!(ids, vec![2, 4, 3, 1]);
        assert!(batcher.is_empty());
    }

    #[test]
    fn updates_to_one_variable_coalesce() {
        let mut batcher = MessageBatcher::new();
        batcher.push(Priority::Medium, Message::update(VarId(2), Some(json!(1)), Properties::new()));
        batcher.push(Priority::Medium, Message::update(VarId(3), Some(json!("x")), Properties::new()));
        batcher.push(Priority::Medium, Message::update(VarId(2), Some(json!(2)), props(&[("type", "T")])));
        assert_eq!(batcher.len(), 2);

        let flushed = batcher.flush();
        assert_eq!(
            flushed[0],
            Message::update(VarId(2), Some(json!(2)), props(&[("type", "T")]))
        );
        assert_eq!(flushed[1].var_id(), Some(VarId(3)));
    }

    #[test]
    fn mixed_priority_properties_split_into_buckets() {
        let mut batcher = MessageBatcher::new();
        batcher.push(Priority::Medium, Message::watch(VarId(9)));
        batcher.push(
            Priority::High,
            Message::update(
                VarId(2),
                Some(json!(5)),
                props(&[("viewdefs:high", "v"), ("label:low", "l"), ("type", "T")]),
            ),
        );
        let flushed = batcher.flush();
        assert_eq!(
            flushed,
            vec![
                Message::update(VarId(2), Some(json!(5)), props(&[("viewdefs", "v")])),
                Message::watch(VarId(9)),
                Message::update(VarId(2), None, props(&[("type", "T")])),
                Message::update(VarId(2), None, props(&[("label", "l")])),
            ]
        );
    }

    #[test]
    fn suffixed_and_plain_keys_flush_alike() {
        let mut batcher = MessageBatcher::new();
        batcher.push(Priority::Medium, Message::update(VarId(2), None, props(&[("type:high", "T")])));
        batcher.push(Priority::Medium, Message::update(VarId(3), None, props(&[("type", "T")])));
        let flushed = batcher.flush();
        assert_eq!(
            flushed,
            vec![
                Message::update(VarId(2), None, props(&[("type", "T")])),
                Message::update(VarId(3), None, props(&[("type", "T")])),
            ]
        );
    }

    #[test]
    fn value_stays_medium_beside_low_property() {
        let mut batcher = MessageBatcher::new();
        batcher.push(
            Priority::Medium,
            Message::update(VarId(2), Some(json!(1)), props(&[("label:low", "l")])),
        );
        batcher.push(Priority::Medium, Message::watch(VarId(4)));
        assert_eq!(
            batcher.flush(),
            vec![
                Message::update(VarId(2), Some(json!(1)), Properties::new()),
                Message::watch(VarId(4)),
                Message::update(VarId(2), None, props(&[("label", "l")])),
            ]
        );
    }

    #[test]
    fn destroy_discards_pending_updates() {
        let mut batcher = MessageBatcher::new();
        batcher.push(Priority::Medium, Message::update(VarId(2), Some(json!(1)), Properties::new()));
        batcher.push(Priority::Medium, Message::destroy(VarId(2)));
        batcher.push(Priority::Medium, Message::update(VarId(2), Some(json!(3)), Properties::new()));
        let flushed = batcher.flush();
        assert_eq!(
            flushed,
            vec![
                Message::destroy(VarId(2)),
                Message::update(VarId(2), Some(json!(3)), Properties::new()),
            ]
        );
    }
}
