//! 同步事件对账演示
//!
//! 运行：cargo run --example reconcile_demo

use std::sync::Arc;

use privchat_sync_events::{
    ExecutionMode, Message, MessageRequestResponseEvent, MessageRequestResponseType, ReceiptEvent,
    ReceiptKind, SharedReceiptSettings, SqliteStore, SyncEventConfig, SyncEventContext,
    ViewOnceOpenEvent,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    privchat_sync_events::init_tracing("info");

    println!("========================================");
    println!("同步事件对账演示");
    println!("========================================\n");

    let store = Arc::new(SqliteStore::open_in_memory()?);
    let settings = SharedReceiptSettings::default();
    let config = SyncEventConfig::builder()
        .execution_mode(ExecutionMode::Test)
        .build();
    let context = SyncEventContext::new(config, store.clone(), Arc::new(settings.clone()));

    let mut events = context.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("📡 通知: {} ({})", event.event_type(), event.conversation_id());
        }
    });

    // === 1. 回执早于消息到达 ===
    let receipt = ReceiptEvent {
        target_sent_at: 1_000,
        receipt_timestamp: 1_100,
        source_service_id: "aci-bob".to_string(),
        source_conversation_id: "bob".to_string(),
        source_device_id: 1,
        kind: ReceiptKind::Read,
        was_sent_with_sealed_sender: false,
    };
    println!("1️⃣ 早到回执: {:?}", context.on_receipt(receipt).await);

    let mut message = Message::outgoing("m1", "bob", 1_000);
    let changed = context.prepare_message(&mut message).await;
    println!(
        "   消息落库前合并: changed={}, state={:?}\n",
        changed,
        message.send_state_by_conversation_id.get("bob")
    );

    // === 2. 一次性消息在其他设备被查看 ===
    let view_once = context
        .on_view_once_sync(ViewOnceOpenEvent {
            source_service_id: Some("aci-alice".to_string()),
            source_conversation_id: None,
            target_sent_at: 2_000,
        })
        .await;
    println!("2️⃣ 一次性消息同步: {:?}\n", view_once);

    // === 3. 消息请求响应 ===
    let response = context
        .on_message_request_response(MessageRequestResponseEvent {
            thread_e164: Some("+15550001".to_string()),
            thread_service_id: None,
            group_id: None,
            response: MessageRequestResponseType::Accept,
            timestamp: 3_000,
        })
        .await;
    println!("3️⃣ 消息请求响应: {:?}\n", response);

    println!("待处理事件: {:?}", context.pending_counts());
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    Ok(())
}
