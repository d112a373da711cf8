mod support;

use std::time::Duration;

use ctk_messenger::HandlerChain;
use ctk_proto::{ConversationTarget, DeliveryState, Username};

use support::{master, settle, SpoofServer};

fn other(user: &str) -> ConversationTarget {
    ConversationTarget::OtherUser(Username::new(user))
}

#[tokio::test]
async fn offline_send_is_retried_then_cancelled() {
    let server = SpoofServer::new();
    let (a, ta, _sa) = master(&server, "m0", "a0", "pw-a", HandlerChain::new()).await;
    let (b, _tb, _sb) = master(&server, "m1", "b0", "pw-b", HandlerChain::new()).await;

    // Prime the session while online so the retried job is a plain send.
    a.send_message(other("m1"), "warmup").await.unwrap();
    settle(&[&a, &b]).await;

    ta.set_online(false);
    let remote_id = a.send_message(other("m1"), "lost").await.unwrap();

    // fast_config uses retry_after(1s, max 3): three failures, then the
    // job is cancelled and the local message stays undelivered.
    tokio::time::sleep(Duration::from_secs(4)).await;
    a.await_done_processing().await;
    assert_eq!(a.pending_jobs(), 0, "cancelled job must leave the queue");

    let chat_a = a.private_conversation_id("m1");
    let lost = a
        .list_messages(&chat_a)
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.remote_id == remote_id)
        .expect("local copy saved");
    assert_eq!(lost.delivery, DeliveryState::Undelivered);

    let chat_b = b.private_conversation_id("m0");
    let texts: Vec<String> = b
        .list_messages(&chat_b)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert!(!texts.contains(&"lost".to_string()));

    // Back online, fresh sends work and the old failure stays sunk.
    ta.set_online(true);
    a.send_message(other("m1"), "after outage").await.unwrap();
    settle(&[&a, &b]).await;

    let texts: Vec<String> = b
        .list_messages(&chat_b)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert!(texts.contains(&"after outage".to_string()));

    let lost = a.get_message(lost.id).await.unwrap();
    assert_eq!(lost.delivery, DeliveryState::Undelivered);
}

#[tokio::test]
async fn queued_jobs_are_visible_in_storage_until_done() {
    let server = SpoofServer::new();
    let (a, _ta, store_a) = master(&server, "m0", "a0", "pw-a", HandlerChain::new()).await;
    let (b, _tb, _sb) = master(&server, "m1", "b0", "pw-b", HandlerChain::new()).await;

    a.send_message(other("m1"), "warmup").await.unwrap();
    settle(&[&a, &b]).await;

    a.pause_queue();
    a.send_message(other("m1"), "durable").await.unwrap();

    use ctk_store::MessengerStore;
    let rows = store_a.list_jobs().await.unwrap();
    assert!(!rows.is_empty(), "job must be persisted before it runs");

    a.resume_queue();
    settle(&[&a, &b]).await;
    let rows = store_a.list_jobs().await.unwrap();
    assert!(rows.is_empty(), "finished jobs must leave storage");
}
