//! 🔄 The Transformer: raw topic messages in, typed records and dead letters out.
//!
//! Pure and synchronous. No I/O, no clocks, no surprises. One bad message never
//! stops a batch: it becomes a [`DeadLetter`] and everything around it carries on.
//!
//! The batch also remembers how far it got on each partition, counting dead
//! letters too. Those positions are what the sink checkpoints once the good
//! records are safely in the table, so a poison message is skipped exactly once
//! and never replayed forever.

use std::collections::BTreeMap;

use crate::broker::TopicMessage;
use crate::errors::PipelineError;
use crate::record::UserRecord;

/// 🪦 A message that could not become a user, and why.
#[derive(Debug)]
pub(crate) struct DeadLetter {
    pub(crate) partition: i32,
    pub(crate) offset: i64,
    pub(crate) error: PipelineError,
    pub(crate) payload: Vec<u8>,
}

/// 📦 One polled batch after parsing.
#[derive(Debug, Default)]
pub(crate) struct TransformedBatch {
    /// ✅ Valid records, in poll order.
    pub(crate) records: Vec<UserRecord>,
    pub(crate) dead_letters: Vec<DeadLetter>,
    /// 📍 Next offset to read per partition, covering every message in the batch.
    pub(crate) positions: BTreeMap<i32, i64>,
    pub(crate) message_count: usize,
}

/// 🔄 Parse every message; valid ones become records, the rest become dead letters.
pub(crate) fn transform_batch(messages: Vec<TopicMessage>) -> TransformedBatch {
    let mut batch = TransformedBatch {
        message_count: messages.len(),
        ..TransformedBatch::default()
    };
    for message in messages {
        let next = message.offset + 1;
        batch
            .positions
            .entry(message.partition)
            .and_modify(|position| *position = (*position).max(next))
            .or_insert(next);

        match UserRecord::from_payload(&message.payload) {
            Ok(record) => batch.records.push(record),
            Err(error) => batch.dead_letters.push(DeadLetter {
                partition: message.partition,
                offset: message.offset,
                error,
                payload: message.payload,
            }),
        }
    }
    batch
}
