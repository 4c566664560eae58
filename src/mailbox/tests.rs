use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::broker::message::{Message, MessageStatus};
use crate::broker::registry::{Handler, handler};
use crate::broker::Broker;
use crate::mailbox::{Mailbox, SendOptions};
use crate::persistence::{MemoryStore, MessageFilter};
use crate::utils::error::MessagingError;

type Inbox = Arc<Mutex<Vec<Message>>>;

fn recorder() -> (Handler, Inbox) {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    let h = handler(move |message| {
        sink.lock().unwrap().push(message.clone());
        Ok(())
    });
    (h, inbox)
}

fn received(inbox: &Inbox) -> Vec<Message> {
    inbox.lock().unwrap().clone()
}

fn stored_broker() -> Arc<Broker> {
    Arc::new(Broker::with_store(Arc::new(MemoryStore::new())))
}

#[tokio::test]
async fn typed_handler_receives_matching_message() {
    let broker = stored_broker();
    let x = Mailbox::new("X", broker.clone());
    let y = Mailbox::new("Y", broker.clone());

    let (greeting, greetings) = recorder();
    y.on_message_type("greeting", greeting).unwrap();
    let (other, others) = recorder();
    y.on_message_type("task", other).unwrap();

    let id = x
        .send_message(["Y"], json!({ "text": "hi" }), SendOptions::new().message_type("greeting"))
        .await
        .unwrap();

    let got = received(&greetings);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].content, json!({ "text": "hi" }));
    assert_eq!(got[0].sender_id, "X");
    assert_eq!(got[0].id, id);
    assert!(received(&others).is_empty());
}

#[tokio::test]
async fn topic_broadcast_reaches_only_subscribers() {
    let broker = Arc::new(Broker::new());
    let y = Mailbox::new("Y", broker.clone());
    let z = Mailbox::new("Z", broker.clone());
    let w = Mailbox::new("W", broker.clone());

    let (alert, alerts) = recorder();
    y.subscribe_topic("alerts", Some(alert)).unwrap();
    let (w_all, w_inbox) = recorder();
    w.on_message(w_all).unwrap();

    z.broadcast_message("alerts", json!("fire"), SendOptions::new())
        .await
        .unwrap();

    let got = received(&alerts);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].content, json!("fire"));
    assert_eq!(got[0].recipient_ids, vec!["Y".to_string()]);
    assert!(received(&w_inbox).is_empty());
}

#[tokio::test]
async fn sends_from_one_sender_arrive_in_order() {
    let broker = stored_broker();
    let sender = Mailbox::new("A", broker.clone());
    let receiver = Mailbox::new("B", broker.clone());

    let (all, inbox) = recorder();
    receiver.on_message(all).unwrap();

    let (first, second, third) = futures::join!(
        sender.send_message(["B"], json!(1), SendOptions::new()),
        sender.send_message(["B"], json!(2), SendOptions::new()),
        sender.send_message(["B"], json!(3), SendOptions::new()),
    );
    let sent = vec![first.unwrap(), second.unwrap(), third.unwrap()];

    let got = received(&inbox);
    let contents: Vec<_> = got.iter().map(|m| m.content.clone()).collect();
    assert_eq!(contents, vec![json!(1), json!(2), json!(3)]);
    let ids: Vec<_> = got.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, sent);
}

#[tokio::test]
async fn resubscribing_rebinds_without_duplicate_registration() {
    let broker = Arc::new(Broker::new());
    let y = Mailbox::new("Y", broker.clone());
    let z = Mailbox::new("Z", broker.clone());

    let (first, first_inbox) = recorder();
    y.subscribe_topic("alerts", Some(first)).unwrap();
    let registered = broker.handler_count();

    let (second, second_inbox) = recorder();
    y.subscribe_topic("alerts", Some(second)).unwrap();
    assert_eq!(broker.handler_count(), registered);
    assert_eq!(y.subscribed_topics(), vec!["alerts".to_string()]);

    z.broadcast_message("alerts", json!("once"), SendOptions::new())
        .await
        .unwrap();
    assert!(received(&first_inbox).is_empty());
    assert_eq!(received(&second_inbox).len(), 1);
}

#[tokio::test]
async fn subscription_without_callback_still_counts() {
    let broker = stored_broker();
    let y = Mailbox::new("Y", broker.clone());
    let z = Mailbox::new("Z", broker.clone());

    y.subscribe_topic("news", None).unwrap();
    assert!(broker.is_subscribed("Y", "news"));

    let id = z
        .broadcast_message("news", json!("headline"), SendOptions::new())
        .await
        .unwrap();
    let stored = broker.get_message(&id).await.unwrap().unwrap();
    assert_eq!(stored.recipient_ids, vec!["Y".to_string()]);
    assert_eq!(stored.status, MessageStatus::Delivered);
}

#[tokio::test]
async fn unsubscribe_topic_stops_delivery() {
    let broker = Arc::new(Broker::new());
    let y = Mailbox::new("Y", broker.clone());
    let z = Mailbox::new("Z", broker.clone());

    let (alert, alerts) = recorder();
    y.subscribe_topic("alerts", Some(alert)).unwrap();
    assert!(y.unsubscribe_topic("alerts").unwrap());
    assert!(!y.unsubscribe_topic("alerts").unwrap());
    assert!(!broker.is_subscribed("Y", "alerts"));

    z.broadcast_message("alerts", json!("late"), SendOptions::new())
        .await
        .unwrap();
    assert!(received(&alerts).is_empty());
    assert!(y.subscribed_topics().is_empty());
}

#[tokio::test]
async fn conversation_handler_and_local_unsubscribe() {
    let broker = stored_broker();
    let x = Mailbox::new("X", broker.clone());
    let y = Mailbox::new("Y", broker.clone());

    let (thread, thread_inbox) = recorder();
    let subscription = y.on_conversation("c-1", thread).unwrap();

    x.send_message(["Y"], json!("in thread"), SendOptions::new().conversation("c-1"))
        .await
        .unwrap();
    x.send_message(["Y"], json!("elsewhere"), SendOptions::new().conversation("c-2"))
        .await
        .unwrap();
    assert_eq!(received(&thread_inbox).len(), 1);

    assert!(subscription.unsubscribe());
    assert!(!subscription.unsubscribe());
    x.send_message(["Y"], json!("after"), SendOptions::new().conversation("c-1"))
        .await
        .unwrap();
    assert_eq!(received(&thread_inbox).len(), 1);
}

#[tokio::test]
async fn local_handlers_run_in_group_order() {
    let broker = Arc::new(Broker::new());
    let x = Mailbox::new("X", broker.clone());
    let y = Mailbox::new("Y", broker.clone());

    let order = Arc::new(Mutex::new(Vec::new()));
    for (label, register) in [("all", 0), ("type", 1), ("conversation", 2)] {
        let order = order.clone();
        let h = handler(move |_| {
            order.lock().unwrap().push(label);
            Ok(())
        });
        match register {
            0 => y.on_message(h).unwrap(),
            1 => y.on_message_type("task", h).unwrap(),
            _ => y.on_conversation("c", h).unwrap(),
        };
    }

    x.send_message(
        ["Y"],
        json!({}),
        SendOptions::new().message_type("task").conversation("c"),
    )
    .await
    .unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["all", "type", "conversation"]);
}

#[tokio::test]
async fn failing_local_handler_does_not_block_others() {
    let broker = Arc::new(Broker::new());
    let x = Mailbox::new("X", broker.clone());
    let y = Mailbox::new("Y", broker.clone());

    y.on_message(handler(|_| Err("boom".into()))).unwrap();
    y.on_message(handler(|_| panic!("handler exploded"))).unwrap();
    let (all, inbox) = recorder();
    y.on_message(all).unwrap();

    x.send_message(["Y"], json!("still here"), SendOptions::new())
        .await
        .unwrap();
    assert_eq!(received(&inbox).len(), 1);
}

#[tokio::test]
async fn status_changes_are_visible_to_queries() {
    let broker = stored_broker();
    let x = Mailbox::new("X", broker.clone());
    let y = Mailbox::new("Y", broker.clone());

    let id = x
        .send_message(["Y"], json!("read me"), SendOptions::new())
        .await
        .unwrap();

    let read = y.mark_as_read(&id).await.unwrap();
    assert_eq!(read.status, MessageStatus::Read);
    let unread = y
        .query_messages(MessageFilter::new().with_status(MessageStatus::Read))
        .await
        .unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].id, id);

    y.mark_as_processed(&id).await.unwrap();
    let processed = y.get_message(&id).await.unwrap().unwrap();
    assert_eq!(processed.status, MessageStatus::Processed);

    let err = y.mark_as_read(&id).await.unwrap_err();
    assert!(matches!(err, MessagingError::InvalidStatusTransition { .. }));
}

#[tokio::test]
async fn handlers_observe_settled_status() {
    let broker = stored_broker();
    let x = Mailbox::new("X", broker.clone());
    let y = Mailbox::new("Y", broker.clone());

    let seen: Arc<Mutex<Vec<(String, MessageStatus)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        y.on_message(handler(move |message| {
            seen.lock().unwrap().push((message.id.clone(), message.status));
            Ok(())
        }))
        .unwrap();
    }

    let id = x.send_message(["Y"], json!("ping"), SendOptions::new()).await.unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(id.clone(), MessageStatus::Delivered)]
    );
    assert_eq!(y.mark_as_read(&id).await.unwrap().status, MessageStatus::Read);
}

#[tokio::test]
async fn queries_default_to_own_inbox() {
    let broker = stored_broker();
    let x = Mailbox::new("X", broker.clone());
    let y = Mailbox::new("Y", broker.clone());
    let z = Mailbox::new("Z", broker.clone());

    x.send_message(["Y"], json!("for y"), SendOptions::new()).await.unwrap();
    x.send_message(["Z"], json!("for z"), SendOptions::new()).await.unwrap();
    z.send_message(["Y"], json!("also y"), SendOptions::new()).await.unwrap();

    let inbox = y.query_messages(MessageFilter::new()).await.unwrap();
    assert_eq!(inbox.len(), 2);
    assert!(inbox.iter().all(|m| m.is_recipient("Y")));

    let sent_by_x = y
        .query_messages(MessageFilter::new().from_sender("X"))
        .await
        .unwrap();
    assert_eq!(sent_by_x.len(), 2);
}

#[tokio::test]
async fn reply_threads_back_to_sender() {
    let broker = stored_broker();
    let x = Mailbox::new("X", broker.clone());
    let y = Mailbox::new("Y", broker.clone());

    let (all, x_inbox) = recorder();
    x.on_message(all).unwrap();

    let id = x
        .send_message(["Y"], json!("question"), SendOptions::new().message_type("ask"))
        .await
        .unwrap();
    let original = y.get_message(&id).await.unwrap().unwrap();
    let reply_id = y.reply(&original, json!("answer"), SendOptions::new()).await.unwrap();

    let got = received(&x_inbox);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, reply_id);
    assert_eq!(got[0].parent_id.as_deref(), Some(id.as_str()));
    assert_eq!(got[0].conversation_id.as_deref(), Some(id.as_str()));
    assert_eq!(got[0].message_type.as_deref(), Some("ask"));
}

#[tokio::test]
async fn send_prebuilt_message_uses_mailbox_identity() {
    let broker = stored_broker();
    let x = Mailbox::new("X", broker.clone());
    let y = Mailbox::new("Y", broker.clone());
    y.subscribe_topic("ops", None).unwrap();

    let direct = Message::new("spoofed", json!("direct")).to(["Y"]);
    let id = x.send(direct).await.unwrap();
    assert_eq!(broker.get_message(&id).await.unwrap().unwrap().sender_id, "X");

    let broadcast = Message::new("X", json!("to ops")).with_topic("ops");
    let id = x.send(broadcast).await.unwrap();
    let stored = broker.get_message(&id).await.unwrap().unwrap();
    assert_eq!(stored.recipient_ids, vec!["Y".to_string()]);
}

#[tokio::test]
async fn close_releases_everything() {
    let broker = stored_broker();
    let baseline = broker.handler_count();
    let y = Mailbox::new("Y", broker.clone());
    let (h, _) = recorder();
    y.subscribe_topic("alerts", Some(h)).unwrap();
    assert!(broker.handler_count() > baseline);

    y.close();
    y.close();
    assert!(y.is_closed());
    assert_eq!(broker.handler_count(), baseline);
    assert!(!broker.is_subscribed("Y", "alerts"));
    assert!(y.subscribed_topics().is_empty());

    let err = y
        .send_message(["X"], json!("nope"), SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::MailboxClosed(ref agent) if agent == "Y"));
    assert!(matches!(
        y.subscribe_topic("alerts", None),
        Err(MessagingError::MailboxClosed(_))
    ));
    let (h, _) = recorder();
    assert!(matches!(y.on_message(h), Err(MessagingError::MailboxClosed(_))));
    assert!(matches!(
        y.query_messages(MessageFilter::new()).await,
        Err(MessagingError::MailboxClosed(_))
    ));
}

#[tokio::test]
async fn dropping_mailbox_closes_it() {
    let broker = stored_broker();
    let x = Mailbox::new("X", broker.clone());
    {
        let y = Mailbox::new("Y", broker.clone());
        y.subscribe_topic("alerts", None).unwrap();
        assert!(broker.is_subscribed("Y", "alerts"));
    }
    assert!(!broker.is_subscribed("Y", "alerts"));

    let id = x.send_message(["Y"], json!("gone"), SendOptions::new()).await.unwrap();
    let stored = broker.get_message(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);
}
