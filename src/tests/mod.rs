//! End-to-end flows across config, broker, store and mailboxes.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tempfile::tempdir;

use crate::config::{ExpiryPolicy, Settings, StoreBackend};
use crate::{Broker, Mailbox, Message, MessageFilter, MessageStatus, SendOptions, handler};

fn durable_settings(data_dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.store.backend = StoreBackend::Durable;
    settings.store.data_dir = data_dir.to_string_lossy().into_owned();
    settings
}

#[tokio::test]
async fn durable_conversation_between_agents() {
    let dir = tempdir().unwrap();
    let broker = Arc::new(Broker::from_settings(&durable_settings(dir.path())).unwrap());
    assert_eq!(broker.store().map(|s| s.kind()), Some("sled"));

    let planner = Mailbox::new("planner", broker.clone());
    let worker = Mailbox::new("worker", broker.clone());

    let tasks: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let tasks = tasks.clone();
        worker
            .on_message_type("task", handler(move |message| {
                tasks.lock().unwrap().push(message.clone());
                Ok(())
            }))
            .unwrap();
    }

    let task_id = planner
        .send_message(
            ["worker"],
            json!({ "do": "index" }),
            SendOptions::new().message_type("task").ttl_secs(600),
        )
        .await
        .unwrap();

    let task = tasks.lock().unwrap().first().cloned().unwrap();
    assert_eq!(task.id, task_id);
    worker.mark_as_read(&task.id).await.unwrap();

    let reply_id = worker
        .reply(&task, json!({ "done": true }), SendOptions::new().message_type("result"))
        .await
        .unwrap();
    worker.mark_as_processed(&task.id).await.unwrap();

    let stored_task = broker.get_message(&task_id).await.unwrap().unwrap();
    assert_eq!(stored_task.status, MessageStatus::Processed);
    assert_eq!(stored_task.delivery_options.ttl_secs, Some(600));

    let thread = planner
        .query_messages(MessageFilter::new().in_conversation(task_id.clone()))
        .await
        .unwrap();
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].id, reply_id);
    assert_eq!(thread[0].parent_id.as_deref(), Some(task_id.as_str()));
    assert_eq!(thread[0].status, MessageStatus::Delivered);

    let everything = broker.count_messages(&MessageFilter::new()).await.unwrap();
    assert_eq!(everything, 2);
}

#[tokio::test]
async fn durable_broadcast_records_resolved_recipients() {
    let dir = tempdir().unwrap();
    let broker = Arc::new(Broker::from_settings(&durable_settings(dir.path())).unwrap());

    let ops_a = Mailbox::new("ops-a", broker.clone());
    let ops_b = Mailbox::new("ops-b", broker.clone());
    let announcer = Mailbox::new("announcer", broker.clone());
    ops_a.subscribe_topic("incidents", None).unwrap();
    ops_b.subscribe_topic("incidents", None).unwrap();

    let observed = Arc::new(Mutex::new(0usize));
    {
        let observed = observed.clone();
        broker.register_topic_observer("incidents", handler(move |_| {
            *observed.lock().unwrap() += 1;
            Ok(())
        }));
    }

    let id = announcer
        .broadcast_message("incidents", json!("db down"), SendOptions::new())
        .await
        .unwrap();
    assert_eq!(*observed.lock().unwrap(), 1);

    let on_topic = broker
        .query_messages(&MessageFilter::new().on_topic("incidents"))
        .await
        .unwrap();
    assert_eq!(on_topic.len(), 1);
    assert_eq!(on_topic[0].id, id);
    assert_eq!(on_topic[0].recipient_ids, vec!["ops-a".to_string(), "ops-b".to_string()]);

    let inbox_b = ops_b.query_messages(MessageFilter::new()).await.unwrap();
    assert_eq!(inbox_b.len(), 1);
}

#[tokio::test]
async fn mark_on_read_expires_stale_messages() {
    let mut settings = Settings::default();
    settings.store.backend = StoreBackend::Transient;
    settings.broker.expiry_policy = ExpiryPolicy::MarkOnRead;
    let broker = Arc::new(Broker::from_settings(&settings).unwrap());

    let sender = Mailbox::new("sender", broker.clone());
    let receiver = Mailbox::new("receiver", broker.clone());

    let stale = Message::new("sender", json!("old"))
        .to(["receiver"])
        .created(chrono::Utc::now() - chrono::Duration::seconds(120))
        .with_options(crate::DeliveryOptions::default().with_ttl_secs(60));
    let stale_id = sender.send(stale).await.unwrap();
    let fresh_id = sender
        .send_message(["receiver"], json!("new"), SendOptions::new().ttl_secs(60))
        .await
        .unwrap();

    let inbox = receiver.query_messages(MessageFilter::new()).await.unwrap();
    let status_of = |id: &str| inbox.iter().find(|m| m.id == id).map(|m| m.status);
    assert_eq!(status_of(&stale_id), Some(MessageStatus::Expired));
    assert_eq!(status_of(&fresh_id), Some(MessageStatus::Delivered));
    assert!(receiver.mark_as_read(&stale_id).await.is_err());
}
