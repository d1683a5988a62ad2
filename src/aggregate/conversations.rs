//! Conversation grouping.
//!
//! Folds the flat per-user message feed into one thread per counterparty.
//! Output does not depend on input order: messages are ordered by a total
//! key, and conversations by their last message then counterparty address.

use futures::future::join_all;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

use crate::cache::ProfileCache;
use crate::model::{Address, Conversation, DirectMessage};

/// Total order on messages: time first, then the remaining fields.
fn message_order(a: &DirectMessage, b: &DirectMessage) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.sender.cmp(&b.sender))
        .then_with(|| a.receiver.cmp(&b.receiver))
        .then_with(|| a.content.cmp(&b.content))
        .then_with(|| a.id.cmp(&b.id))
}

/// The other party of `message`, if `me` is one of its parties.
pub fn counterparty(message: &DirectMessage, me: &Address) -> Option<Address> {
    if message.sender == *me {
        Some(message.receiver)
    } else if message.receiver == *me {
        Some(message.sender)
    } else {
        None
    }
}

/// Group `messages` by counterparty, newest conversation first.
///
/// Messages are kept oldest first within a thread. Messages that do not
/// involve `me` are ignored.
pub async fn group_conversations(
    cache: &ProfileCache,
    me: &Address,
    messages: Vec<DirectMessage>,
) -> Vec<Conversation> {
    let mut groups: BTreeMap<Address, Vec<DirectMessage>> = BTreeMap::new();
    for message in messages {
        match counterparty(&message, me) {
            Some(peer) => groups.entry(peer).or_default().push(message),
            None => debug!(
                sender = %message.sender,
                receiver = %message.receiver,
                "Ignoring message not involving current user"
            ),
        }
    }

    let mut conversations = join_all(groups.into_iter().filter_map(|(peer, mut thread)| {
        thread.sort_by(message_order);
        let last_message = thread.last().cloned()?;
        Some(async move {
            Conversation {
                counterparty_display_name: cache.display_name(&peer).await,
                counterparty_address: peer,
                last_message,
                messages: thread,
            }
        })
    }))
    .await;

    sort_conversations(&mut conversations);
    conversations
}

fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        message_order(&b.last_message, &a.last_message)
            .then_with(|| a.counterparty_address.cmp(&b.counterparty_address))
    });
}

/// Insert a sent or received message into already grouped conversations.
///
/// `display_name` labels the thread if the counterparty is new. Returns
/// `false` and leaves `conversations` untouched if `message` does not
/// involve `me`.
pub fn insert_message(
    conversations: &mut Vec<Conversation>,
    me: &Address,
    message: DirectMessage,
    display_name: String,
) -> bool {
    let Some(peer) = counterparty(&message, me) else {
        return false;
    };
    match conversations
        .iter_mut()
        .find(|c| c.counterparty_address == peer)
    {
        Some(conversation) => {
            conversation.messages.push(message);
            conversation.messages.sort_by(message_order);
            if let Some(last) = conversation.messages.last() {
                conversation.last_message = last.clone();
            }
        }
        None => conversations.push(Conversation {
            counterparty_address: peer,
            counterparty_display_name: display_name,
            last_message: message.clone(),
            messages: vec![message],
        }),
    }
    sort_conversations(conversations);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::fixtures::{addr, cache, profile};
    use chrono::{TimeZone, Utc};

    fn dm(sender: Address, receiver: Address, content: &str, secs: i64) -> DirectMessage {
        DirectMessage {
            id: None,
            sender,
            receiver,
            content: content.into(),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn feed() -> Vec<DirectMessage> {
        let (me, bb, cc) = (addr(0xaa), addr(0xbb), addr(0xcc));
        vec![
            dm(me, bb, "hi bb", 100),
            dm(cc, me, "hello from cc", 150),
            dm(bb, me, "hey, newest", 200),
        ]
    }

    #[tokio::test]
    async fn test_groups_by_counterparty_newest_first() {
        let cache = cache(vec![profile(addr(0xbb), "Bob", &[])]);

        let conversations = group_conversations(&cache, &addr(0xaa), feed()).await;

        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].counterparty_address, addr(0xbb));
        assert_eq!(conversations[0].counterparty_display_name, "Bob");
        assert_eq!(conversations[0].messages.len(), 2);
        assert_eq!(conversations[0].last_message.content, "hey, newest");
        assert_eq!(conversations[1].counterparty_display_name, addr(0xcc).short_label());
    }

    #[tokio::test]
    async fn test_grouping_is_order_independent() {
        let cache = cache(Vec::new());
        let me = addr(0xaa);
        let mut messages = feed();
        // Same timestamp in two threads, tie broken deterministically.
        messages.push(dm(addr(0xdd), me, "tie", 200));

        let forward = group_conversations(&cache, &me, messages.clone()).await;
        messages.reverse();
        let reversed = group_conversations(&cache, &me, messages.clone()).await;
        messages.rotate_left(2);
        let rotated = group_conversations(&cache, &me, messages).await;

        assert_eq!(forward, reversed);
        assert_eq!(forward, rotated);
    }

    #[tokio::test]
    async fn test_empty_feed() {
        let cache = cache(Vec::new());
        assert!(group_conversations(&cache, &addr(0xaa), Vec::new()).await.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_messages_ignored() {
        let cache = cache(Vec::new());
        let messages = vec![dm(addr(0xbb), addr(0xcc), "not mine", 10)];
        assert!(group_conversations(&cache, &addr(0xaa), messages).await.is_empty());
    }

    #[tokio::test]
    async fn test_insert_message_moves_thread_to_top() {
        let cache = cache(Vec::new());
        let me = addr(0xaa);
        let mut conversations = group_conversations(&cache, &me, feed()).await;

        let reply = dm(me, addr(0xcc), "reply", 300);
        assert!(insert_message(&mut conversations, &me, reply, "unused".into()));

        assert_eq!(conversations[0].counterparty_address, addr(0xcc));
        assert_eq!(conversations[0].counterparty_display_name, addr(0xcc).short_label());
        assert_eq!(conversations[0].messages.len(), 2);
        assert_eq!(conversations[0].last_message.content, "reply");
    }

    #[tokio::test]
    async fn test_insert_message_matches_regrouping() {
        let cache = cache(Vec::new());
        let me = addr(0xaa);
        let mut messages = feed();
        let mut conversations = group_conversations(&cache, &me, messages.clone()).await;

        let new_peer = dm(addr(0xdd), me, "first contact", 50);
        let label = addr(0xdd).short_label();
        assert!(insert_message(&mut conversations, &me, new_peer.clone(), label));
        messages.push(new_peer);

        assert_eq!(conversations, group_conversations(&cache, &me, messages).await);
    }

    #[test]
    fn test_insert_foreign_message_is_rejected() {
        let mut conversations = Vec::new();
        let foreign = dm(addr(0xbb), addr(0xcc), "not mine", 10);
        assert!(!insert_message(&mut conversations, &addr(0xaa), foreign, "x".into()));
        assert!(conversations.is_empty());
    }
}
