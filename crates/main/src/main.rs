//! 主程序入口
//!
//! 为单个登录用户启动实时运行时：建立全局订阅（本人在场、信令流、
//! 通知流），可选地打开一个会话，并把客户端事件打到日志，
//! 作为界面接入点的替身。

use std::env;

use anyhow::Context;
use application::RealtimeRuntime;
use config::AppConfig;
use domain::{ConversationId, ConversationRepository, UserId};
use infrastructure::Infrastructure;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::from_env_with_defaults();
    config.validate()?;

    let user_id = env::var("PARLEY_USER_ID")
        .context("PARLEY_USER_ID is required (UUID of the signed-in user)")?;
    let user_id = UserId::from(
        Uuid::parse_str(&user_id).context("PARLEY_USER_ID must be a valid UUID")?,
    );

    let infrastructure = Infrastructure::connect(&config).await?;
    let runtime = RealtimeRuntime::new(
        infrastructure.runtime_dependencies(),
        config.realtime.clone(),
        user_id,
    );
    runtime.start().await?;

    let mut events = runtime.events().subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(event = ?event, "client event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "client event log lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // 指定了会话ID就直接打开该会话
    let session = match env::var("PARLEY_CONVERSATION_ID").ok() {
        Some(raw) => {
            let conversation_id = ConversationId::from(
                Uuid::parse_str(&raw).context("PARLEY_CONVERSATION_ID must be a valid UUID")?,
            );
            let conversation = infrastructure
                .storage
                .conversations
                .find_by_id(conversation_id)
                .await?
                .context("conversation not found")?;
            Some(runtime.open_conversation(conversation).await?)
        }
        None => None,
    };

    tracing::info!(user_id = %user_id, "parley runtime ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    if let Some(session) = session {
        session.close().await;
    }
    runtime.shutdown().await;
    event_log.abort();

    Ok(())
}
