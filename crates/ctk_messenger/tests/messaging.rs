mod support;

use std::sync::Arc;

use ctk_messenger::{CypherMessenger, HandlerChain};
use ctk_proto::{ConversationTarget, DeliveryState, Username};

use support::{master, settle, AcceptRegistrations, SpoofServer};

fn other(user: &str) -> ConversationTarget {
    ConversationTarget::OtherUser(Username::new(user))
}

#[tokio::test]
async fn basic_single_recipient() {
    let server = SpoofServer::new();
    let (a, _ta, _sa) = master(&server, "m0", "a0", "pw-a", HandlerChain::new()).await;
    let (b, _tb, _sb) = master(&server, "m1", "b0", "pw-b", HandlerChain::new()).await;

    let chat_a = a.create_private_chat("m1").await.unwrap();
    a.send_message(other("m1"), "Hello").await.unwrap();
    settle(&[&a, &b]).await;

    let chat_b = b.private_conversation_id("m0");
    let messages_a = a.list_messages(&chat_a).await.unwrap();
    let messages_b = b.list_messages(&chat_b).await.unwrap();
    assert_eq!(messages_a.len(), 1);
    assert_eq!(messages_b.len(), 1);
    assert_eq!(messages_a[0].text, "Hello");
    assert_eq!(messages_b[0].text, "Hello");
    // The received receipt upgraded the sender's copy.
    assert_eq!(messages_a[0].delivery, DeliveryState::Received);

    a.send_message(other("m1"), "Hello").await.unwrap();
    b.send_message(other("m0"), "Hello").await.unwrap();
    settle(&[&a, &b]).await;

    assert_eq!(a.list_messages(&chat_a).await.unwrap().len(), 3);
    assert_eq!(b.list_messages(&chat_b).await.unwrap().len(), 3);
}

#[tokio::test]
async fn multi_device_fanout() {
    let server = SpoofServer::new();
    let (d0, _t0, _s0) = master(
        &server,
        "m0",
        "d0",
        "pw-0",
        HandlerChain::new().with(Arc::new(AcceptRegistrations)),
    )
    .await;

    let store1 = ctk_store::MemoryStore::new();
    let t1 = server.transport("m0", "d1");
    let d1 = CypherMessenger::register_device(
        "m0",
        "d1",
        "pw-1",
        Arc::new(store1),
        t1,
        support::fast_config(),
        HandlerChain::new(),
    )
    .await
    .unwrap();

    let (m1, _tm, _sm) = master(&server, "m1", "e0", "pw-e", HandlerChain::new()).await;
    settle(&[&d0, &d1, &m1]).await;

    d1.send_message(other("m1"), "Hello").await.unwrap();
    settle(&[&d0, &d1, &m1]).await;

    let chat_d1 = d1.private_conversation_id("m1");
    let chat_d0 = d0.private_conversation_id("m1");
    let chat_m1 = m1.private_conversation_id("m0");

    let on_d1 = d1.list_messages(&chat_d1).await.unwrap();
    let on_d0 = d0.list_messages(&chat_d0).await.unwrap();
    let on_m1 = m1.list_messages(&chat_m1).await.unwrap();

    assert_eq!(on_d1.len(), 1, "sender device keeps its copy");
    assert_eq!(on_d0.len(), 1, "sibling device receives the sync copy");
    assert_eq!(on_m1.len(), 1, "recipient receives the message");
    assert!(on_d0[0].text == "Hello" && on_m1[0].text == "Hello");
}

#[tokio::test]
async fn out_of_order_delivery() {
    let server = SpoofServer::new();
    let (a, _ta, _sa) = master(&server, "m0", "a0", "pw-a", HandlerChain::new()).await;
    let (b, _tb, _sb) = master(&server, "m1", "b0", "pw-b", HandlerChain::new()).await;

    server.hold(true);
    a.send_message(other("m1"), "first").await.unwrap();
    a.send_message(other("m1"), "second").await.unwrap();
    a.send_message(other("m1"), "third").await.unwrap();
    settle(&[&a]).await;
    assert_eq!(server.held_count(), 3);

    server.hold(false);
    server.release_held(&[1, 0, 2]);
    settle(&[&a, &b]).await;

    let chat_b = b.private_conversation_id("m0");
    let messages = b.list_messages(&chat_b).await.unwrap();
    assert_eq!(messages.len(), 3);
    // `order` re-establishes sender order regardless of delivery order.
    let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn multi_recipient_envelope_path() {
    let server = SpoofServer::new();
    let (d0, _t0, _s0) = master(
        &server,
        "m0",
        "d0",
        "pw-0",
        HandlerChain::new().with(Arc::new(AcceptRegistrations)),
    )
    .await;

    let store1 = ctk_store::MemoryStore::new();
    let t1 = server.transport("m0", "d1");
    let d1 = CypherMessenger::register_device(
        "m0",
        "d1",
        "pw-1",
        Arc::new(store1),
        t1.clone(),
        support::fast_config(),
        HandlerChain::new(),
    )
    .await
    .unwrap();
    let (m1, _tm, _sm) = master(&server, "m1", "e0", "pw-e", HandlerChain::new()).await;
    settle(&[&d0, &d1, &m1]).await;

    t1.set_multi_recipient(true);
    d1.send_message(other("m1"), "once sealed").await.unwrap();
    settle(&[&d0, &d1, &m1]).await;

    assert_eq!(
        d0.list_messages(&d0.private_conversation_id("m1")).await.unwrap().len(),
        1
    );
    assert_eq!(
        m1.list_messages(&m1.private_conversation_id("m0")).await.unwrap().len(),
        1
    );
    assert_eq!(
        d1.list_messages(&d1.private_conversation_id("m1")).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn duplicate_delivery_is_idempotent() {
    let server = SpoofServer::new();
    let (a, _ta, _sa) = master(&server, "m0", "a0", "pw-a", HandlerChain::new()).await;
    let (b, _tb, _sb) = master(&server, "m1", "b0", "pw-b", HandlerChain::new()).await;

    a.send_message(other("m1"), "only once").await.unwrap();
    settle(&[&a, &b]).await;

    // The server re-delivers everything it ever sent to b0.
    server.replay("m1", "b0");
    settle(&[&a, &b]).await;

    let chat_b = b.private_conversation_id("m0");
    let messages = b.list_messages(&chat_b).await.unwrap();
    assert_eq!(messages.len(), 1, "duplicate (sender, message id) must be dropped");
}

#[tokio::test]
async fn restart_resumes_persisted_jobs() {
    let server = SpoofServer::new();
    let (a, _ta, store_a) = master(&server, "m0", "a0", "pw-a", HandlerChain::new()).await;
    let (b, _tb, _sb) = master(&server, "m1", "b0", "pw-b", HandlerChain::new()).await;

    // Prime the session so the queued job is a plain send.
    a.send_message(other("m1"), "warmup").await.unwrap();
    settle(&[&a, &b]).await;

    a.pause_queue();
    a.send_message(other("m1"), "survives restart").await.unwrap();
    assert!(a.pending_jobs() >= 1);
    drop(a);

    let a2 = CypherMessenger::unlock(
        "pw-a",
        Arc::new(store_a),
        server.transport("m0", "a0"),
        support::fast_config(),
        HandlerChain::new(),
    )
    .await
    .unwrap();
    settle(&[&a2, &b]).await;

    let chat_b = b.private_conversation_id("m0");
    let texts: Vec<String> = b
        .list_messages(&chat_b)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert!(texts.contains(&"survives restart".to_string()));
}

#[tokio::test]
async fn unlock_rejects_wrong_password() {
    let server = SpoofServer::new();
    let (a, _ta, store_a) = master(&server, "m0", "a0", "pw-a", HandlerChain::new()).await;
    drop(a);

    let result = CypherMessenger::unlock(
        "wrong",
        Arc::new(store_a),
        server.transport("m0", "a0"),
        support::fast_config(),
        HandlerChain::new(),
    )
    .await;
    assert!(matches!(
        result,
        Err(ctk_messenger::MessengerError::CorruptConfig)
    ));
}
