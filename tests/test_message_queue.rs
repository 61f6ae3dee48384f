//! Outbound message queue tests
//!
//! Messages published without a usable connection are queued and flushed,
//! in order, once a broker accepts a connection.


use adaptive_publisher::testing::BrokerScript;
use adaptive_publisher::QoS;
use bytes::Bytes;
use test_helpers::{eventually, mock_publisher, X, Y};

fn payloads(messages: &[adaptive_publisher::testing::PublishedMessage]) -> Vec<Bytes> {
    messages.iter().map(|m| m.payload.clone()).collect()
}

#[tokio::test]
async fn test_messages_published_while_disconnected_flush_in_order() {
    // Arrange
    let (publisher, factory) = mock_publisher(&[X]);
    for n in 1..=3 {
        let token = publisher
            .publish("test/message", format!("queued #{n}"), QoS::AtLeastOnce, false)
            .await;
        assert!(token.is_none());
    }
    assert_eq!(publisher.queued_message_count(), 3);
    assert!(factory.published().is_empty());

    // Act
    assert!(publisher.connect().await);

    // Assert
    assert_eq!(publisher.queued_message_count(), 0);
    assert_eq!(
        payloads(&factory.published_to(X)),
        vec![
            Bytes::from("queued #1"),
            Bytes::from("queued #2"),
            Bytes::from("queued #3"),
        ]
    );
}

#[tokio::test]
async fn test_queue_keeps_newest_messages_on_overflow() {
    let (publisher, factory) = mock_publisher(&[X]);
    let capacity = publisher.orchestrator().config().max_queue_size;

    for n in 0..=capacity {
        publisher
            .publish("test/message", n.to_string(), QoS::AtMostOnce, false)
            .await;
    }
    assert_eq!(publisher.queued_message_count(), capacity);

    assert!(publisher.connect().await);
    let delivered = payloads(&factory.published_to(X));
    assert_eq!(delivered.len(), capacity);
    assert_eq!(delivered.first(), Some(&Bytes::from("1")));
    assert_eq!(delivered.last(), Some(&Bytes::from(capacity.to_string())));
}

#[tokio::test]
async fn test_failed_publish_is_requeued_not_dropped() {
    let (publisher, factory) = mock_publisher(&[X]);
    assert!(publisher.connect().await);
    factory.script(X, BrokerScript::default().failing_publishes());

    let token = publisher
        .publish("test/message", "important", QoS::ExactlyOnce, true)
        .await;
    assert!(token.is_none());
    assert_eq!(publisher.queued_message_count(), 1);

    let queued = publisher.orchestrator().queued_messages();
    assert_eq!(queued[0].topic, "test/message");
    assert_eq!(queued[0].qos, QoS::ExactlyOnce);
    assert!(queued[0].retained);
}

#[tokio::test]
async fn test_flush_stops_at_first_failure_and_resumes_after_failover() {
    let (publisher, factory) = mock_publisher(&[X, Y]);
    factory.script(X, BrokerScript::default().failing_publishes());
    for n in 1..=2 {
        publisher
            .publish("test/message", format!("m{n}"), QoS::AtLeastOnce, false)
            .await;
    }

    // X accepts the connection but rejects every publish
    assert!(publisher.connect().await);
    assert_eq!(publisher.current_broker_uri(), X);
    assert_eq!(publisher.queued_message_count(), 2);
    assert!(factory.published_to(X).is_empty());

    // Losing X moves us to Y, which drains the queue in order
    factory.script(X, BrokerScript::refusing());
    factory.drop_connection(X, "broker overloaded");

    assert!(eventually(|| publisher.queued_message_count() == 0).await);
    assert_eq!(
        payloads(&factory.published_to(Y)),
        vec![Bytes::from("m1"), Bytes::from("m2")]
    );
}

#[tokio::test]
async fn test_direct_publish_preserves_order_after_flush() {
    let (publisher, factory) = mock_publisher(&[X]);
    publisher
        .publish("test/message", "early", QoS::AtLeastOnce, false)
        .await;
    assert!(publisher.connect().await);

    let token = publisher
        .publish("test/message", "late", QoS::AtLeastOnce, false)
        .await;
    assert!(token.is_some());
    assert_eq!(
        payloads(&factory.published_to(X)),
        vec![Bytes::from("early"), Bytes::from("late")]
    );
}

#[tokio::test]
async fn test_publish_while_connected_sends_backlog_first() {
    // Arrange: one message stuck in the queue while the link stays up
    let (publisher, factory) = mock_publisher(&[X]);
    assert!(publisher.connect().await);
    factory.script(X, BrokerScript::default().failing_publishes());
    let token = publisher
        .publish("test/message", "m1", QoS::AtLeastOnce, false)
        .await;
    assert!(token.is_none());
    assert_eq!(publisher.queued_message_count(), 1);
    assert!(publisher.is_connected());

    // Act: the broker accepts publishes again
    factory.script(X, BrokerScript::default());
    let token = publisher
        .publish("test/message", "m2", QoS::AtLeastOnce, false)
        .await;

    // Assert: the backlog goes out ahead of the new message
    assert!(token.is_some());
    assert_eq!(publisher.queued_message_count(), 0);
    assert_eq!(
        payloads(&factory.published_to(X)),
        vec![Bytes::from("m1"), Bytes::from("m2")]
    );
}

#[tokio::test]
async fn test_publish_queues_behind_backlog_that_cannot_drain() {
    let (publisher, factory) = mock_publisher(&[X]);
    assert!(publisher.connect().await);
    factory.script(X, BrokerScript::default().failing_publishes());

    for payload in ["m1", "m2"] {
        let token = publisher
            .publish("test/message", payload, QoS::AtLeastOnce, false)
            .await;
        assert!(token.is_none());
    }

    let queued: Vec<_> = publisher
        .orchestrator()
        .queued_messages()
        .into_iter()
        .map(|m| m.payload)
        .collect();
    assert_eq!(queued, vec![Bytes::from("m1"), Bytes::from("m2")]);
    assert!(factory.published_to(X).is_empty());
}
