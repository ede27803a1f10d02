use super::*;
use crate::bus::Headers;

fn flat_fault() -> MessageEnvelope {
    let mut headers = Headers::new();
    for (key, value) in [
        (mt::REASON, "fault"),
        (mt::MESSAGE_ID, "0b5d0000-5d9a-0015-e4a5-08dc3f1b4b3c"),
        (mt::MESSAGE_TYPE, "urn:message:Sales:OrderPlaced"),
        (mt::CONVERSATION_ID, "0b5d0000-5d9a-0015-c0e1-08dc3f1b4b3d"),
        (mt::CORRELATION_ID, "corr-1"),
        (mt::SOURCE_ADDRESS, "rabbitmq://localhost/sales/order_api"),
        (mt::SENT_TIME, "2024-03-05T14:07:09.5Z"),
        (mt::HOST_INFO, r#"{"MachineName":"web-01","ProcessName":"Sales"}"#),
        (mt::HOST_MACHINE_NAME, "worker-07"),
        (mt::FAULT_INPUT_ADDRESS, "rabbitmq://localhost/sales/order_processor"),
        (mt::FAULT_EXCEPTION_TYPE, "System.InvalidOperationException"),
        (mt::FAULT_MESSAGE, "Order is locked"),
        (mt::FAULT_STACK_TRACE, "at Sales.Handle()"),
        (mt::FAULT_TIMESTAMP, "2024-03-05T14:07:10Z"),
        (mt::FAULT_RETRY_COUNT, "2"),
    ] {
        headers.insert(key.to_string(), value.to_string());
    }
    MessageEnvelope::new("native-1", headers, br#"{"orderId":42}"#.to_vec(), "order_processor_error")
}

fn envelope_fault() -> MessageEnvelope {
    let mut headers = Headers::new();
    headers.insert(mt::REASON.to_string(), "fault".to_string());
    headers.insert(
        mt::FAULT_INPUT_ADDRESS.to_string(),
        "rabbitmq://localhost/order_processor".to_string(),
    );
    headers.insert(
        mt::FAULT_TIMESTAMP.to_string(),
        "2024-03-05T14:07:10Z".to_string(),
    );
    let body = r#"{
        "messageId": "msg-42",
        "conversationId": "conv-42",
        "sourceAddress": "rabbitmq://localhost/order_api",
        "messageType": ["urn:message:Sales:OrderPlaced", "urn:message:Sales:IOrderEvent"],
        "sentTime": "2024-03-05T14:07:09Z",
        "expirationTime": "2024-03-05T14:08:39Z",
        "message": {"orderId": 42},
        "host": {"machineName": "web-02", "processName": "Sales"}
    }"#;
    MessageEnvelope::new("native-2", headers, body.as_bytes().to_vec(), "order_processor_error")
}

#[test]
fn test_missing_fault_marker_is_invalid_format() {
    let mut envelope = flat_fault();
    envelope.headers.remove(mt::REASON);

    let result = to_target_schema(&mut envelope);
    assert!(matches!(result, Err(ConversionError::InvalidFormat(_))));
}

#[test]
fn test_non_fault_reason_is_invalid_format() {
    let mut envelope = flat_fault();
    envelope
        .headers
        .insert(mt::REASON.to_string(), "dead-letter".to_string());

    let result = to_target_schema(&mut envelope);
    assert!(matches!(result, Err(ConversionError::InvalidFormat(_))));
}

#[test]
fn test_flat_headers_translation() {
    let mut envelope = flat_fault();
    to_target_schema(&mut envelope).unwrap();

    let h = |key: &str| envelope.header(key).unwrap().to_string();
    assert_eq!(h(nsb::CONTENT_TYPE), "application/json");
    assert_eq!(h(nsb::MESSAGE_ID), "0b5d0000-5d9a-0015-e4a5-08dc3f1b4b3c");
    assert_eq!(h(nsb::ENCLOSED_MESSAGE_TYPES), "urn:message:Sales:OrderPlaced");
    assert_eq!(h(nsb::TIME_SENT), "2024-03-05 14:07:09:500000 Z");
    assert_eq!(h(nsb::CONVERSATION_ID), "0b5d0000-5d9a-0015-c0e1-08dc3f1b4b3d");
    assert_eq!(h(nsb::CORRELATION_ID), "corr-1");
    assert_eq!(h(nsb::ORIGINATING_ENDPOINT), "rabbitmq://localhost/sales/order_api");
    assert_eq!(h(nsb::ORIGINATING_MACHINE), "web-01");
    assert_eq!(h(nsb::PROCESSING_MACHINE), "worker-07");
    assert_eq!(h(nsb::PROCESSING_ENDPOINT), "rabbitmq://localhost/sales/order_processor");
    assert_eq!(h(nsb::FAILED_QUEUE), "rabbitmq://localhost/sales/order_processor");
    assert_eq!(h(nsb::DELAYED_RETRIES), "2");
    assert_eq!(h(nsb::EXCEPTION_TYPE), "System.InvalidOperationException");
    assert_eq!(h(nsb::EXCEPTION_MESSAGE), "Order is locked");
    assert_eq!(h(nsb::EXCEPTION_STACK_TRACE), "at Sales.Handle()");
    assert_eq!(h(nsb::TIME_OF_FAILURE), "2024-03-05 14:07:10:000000 Z");
    assert!(envelope.header(nsb::TIME_TO_BE_RECEIVED).is_none());
}

#[test]
fn test_envelope_body_translation() {
    let mut envelope = envelope_fault();
    to_target_schema(&mut envelope).unwrap();

    let h = |key: &str| envelope.header(key).unwrap().to_string();
    assert_eq!(h(nsb::CONTENT_TYPE), "application/vnd.masstransit+json");
    assert_eq!(h(nsb::MESSAGE_ID), "msg-42");
    assert_eq!(
        h(nsb::ENCLOSED_MESSAGE_TYPES),
        "urn:message:Sales:OrderPlaced,urn:message:Sales:IOrderEvent"
    );
    assert_eq!(h(nsb::TIME_SENT), "2024-03-05 14:07:09:000000 Z");
    assert_eq!(h(nsb::TIME_TO_BE_RECEIVED), "00:01:30");
    assert_eq!(h(nsb::ORIGINATING_ENDPOINT), "rabbitmq://localhost/order_api");
    assert_eq!(h(nsb::ORIGINATING_MACHINE), "web-02");
    assert_eq!(h(nsb::PROCESSING_ENDPOINT), "rabbitmq://localhost/order_processor");
    assert!(envelope.header(nsb::CORRELATION_ID).is_none());
    assert!(envelope.header(nsb::EXCEPTION_TYPE).is_none());
}

#[test]
fn test_envelope_body_must_be_json() {
    let mut envelope = envelope_fault();
    envelope.body = bytes::Bytes::from_static(b"<xml/>");

    let result = to_target_schema(&mut envelope);
    assert!(matches!(result, Err(ConversionError::InvalidFormat(_))));
}

#[test]
fn test_fault_input_address_falls_back_to_receive_address() {
    let mut envelope = flat_fault();
    envelope.headers.remove(mt::FAULT_INPUT_ADDRESS);

    to_target_schema(&mut envelope).unwrap();

    assert_eq!(
        envelope.header(nsb::PROCESSING_ENDPOINT),
        Some("order_processor_error")
    );
    assert_eq!(envelope.header(nsb::FAILED_QUEUE), Some("order_processor_error"));
    assert_eq!(
        envelope.header(mt::FAULT_INPUT_ADDRESS),
        Some("queue:order_processor_error")
    );
}

#[test]
fn test_missing_fault_timestamp_uses_now() {
    let mut envelope = flat_fault();
    envelope.headers.remove(mt::FAULT_TIMESTAMP);
    let before = Utc::now() - chrono::TimeDelta::seconds(1);

    to_target_schema(&mut envelope).unwrap();

    let failed_at = parse_timestamp(envelope.header(nsb::TIME_OF_FAILURE).unwrap()).unwrap();
    assert!(failed_at >= before);
}

#[test]
fn test_missing_sent_time_uses_fault_timestamp() {
    let mut envelope = flat_fault();
    envelope.headers.remove(mt::SENT_TIME);

    to_target_schema(&mut envelope).unwrap();

    assert_eq!(
        envelope.header(nsb::TIME_SENT),
        Some("2024-03-05 14:07:10:000000 Z")
    );
}

#[test]
fn test_optional_fields_degrade_gracefully() {
    let mut headers = Headers::new();
    headers.insert(mt::REASON.to_string(), "fault".to_string());
    headers.insert(mt::MESSAGE_ID.to_string(), "only-id".to_string());
    let mut envelope = MessageEnvelope::new("native-3", headers, Vec::new(), "sparse_error");

    to_target_schema(&mut envelope).unwrap();

    assert_eq!(envelope.header(nsb::MESSAGE_ID), Some("only-id"));
    assert!(envelope.header(nsb::TIME_OF_FAILURE).is_some());
    assert!(envelope.header(nsb::ENCLOSED_MESSAGE_TYPES).is_none());
    assert!(envelope.header(nsb::ORIGINATING_MACHINE).is_none());
}

#[test]
fn test_to_source_schema_strips_target_headers() {
    let mut envelope = flat_fault();
    to_target_schema(&mut envelope).unwrap();
    envelope.headers.insert(
        sc::TARGET_ENDPOINT_ADDRESS.to_string(),
        "order_processor".to_string(),
    );
    envelope.headers.insert(
        sc::RETRY_ACKNOWLEDGEMENT_QUEUE.to_string(),
        "Particular.ServiceControl".to_string(),
    );

    to_source_schema(&mut envelope);

    assert!(envelope
        .headers
        .keys()
        .all(|k| !k.starts_with("NServiceBus.")));
    assert!(envelope.header(sc::TARGET_ENDPOINT_ADDRESS).is_none());
    assert_eq!(
        envelope.header(sc::RETRY_ACKNOWLEDGEMENT_QUEUE),
        Some("Particular.ServiceControl")
    );
    assert_eq!(envelope.header(mt::REASON), Some("fault"));
    assert_eq!(
        envelope.header(mt::MESSAGE_ID),
        Some("0b5d0000-5d9a-0015-e4a5-08dc3f1b4b3c")
    );
}

#[test]
fn test_to_source_schema_is_idempotent() {
    for mut envelope in [flat_fault(), envelope_fault()] {
        to_target_schema(&mut envelope).unwrap();
        envelope
            .headers
            .insert(sc::RETRY_TO.to_string(), "Retry.Return".to_string());

        to_source_schema(&mut envelope);
        let once = envelope.clone();
        to_source_schema(&mut envelope);

        assert_eq!(envelope, once);
    }
}

#[test]
fn test_queue_name_from_address() {
    assert_eq!(
        queue_name_from_address("rabbitmq://localhost/vhost/order_processor"),
        "order_processor"
    );
    assert_eq!(
        queue_name_from_address("rabbitmq://localhost/order_processor?bind=true"),
        "order_processor"
    );
    assert_eq!(queue_name_from_address("queue:order_processor"), "order_processor");
    assert_eq!(queue_name_from_address("order_processor"), "order_processor");
    assert_eq!(queue_name_from_address("Retry.Return"), "Retry.Return");
    assert_eq!(queue_name_from_address("exchange:orders"), "orders");
}

#[test]
fn test_queue_name_with_colon_is_not_a_uri() {
    assert_eq!(queue_name_from_address("host:5672"), "host:5672");
    assert_eq!(queue_name_from_address("sales:orders_error"), "sales:orders_error");
}
