use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing_subscriber::EnvFilter;

use ciphertalk_client::auth::{AuthUser, StaticAuth};
use ciphertalk_client::config::ClientConfig;
use ciphertalk_client::connectivity::NetworkStatus;
use ciphertalk_client::erasure::HttpErasureClient;
use ciphertalk_client::messages::SendMessageRequest;
use ciphertalk_client::queue::{self, QueueDb};
use ciphertalk_client::store::MemoryStore;
use ciphertalk_client::ChatClient;
use ciphertalk_shared::ids::UserId;
use ciphertalk_shared::model::Profile;

struct Participant {
    id: UserId,
    network: Arc<NetworkStatus>,
    client: ChatClient,
}

fn participant(
    store: &Arc<MemoryStore>,
    config: &ClientConfig,
    name: &str,
    queue_db: QueueDb,
) -> Result<Participant, Box<dyn std::error::Error>> {
    let id = UserId::new();
    let email = format!("{name}@ciphertalk.local");
    store.add_profile(Profile {
        user_id: id,
        email: email.clone(),
        display_name: Some(name.to_string()),
        created_at: Utc::now(),
    });

    let auth = Arc::new(StaticAuth::signed_in(AuthUser { id, email }, format!("{name}-session")));
    let network = Arc::new(NetworkStatus::new(true));
    let erasure = Arc::new(HttpErasureClient::new(config.erasure_url.clone())?);
    let client = ChatClient::new(
        store.repositories(),
        auth,
        network.clone(),
        erasure,
        queue_db,
        config,
    );
    Ok(Participant {
        id,
        network,
        client,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = ClientConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let store = MemoryStore::new();
    let alice = participant(
        &store,
        &config,
        "alice",
        queue::open_queue_db(Path::new(&config.queue_db_path))?,
    )?;
    // Items left by an earlier run point at conversations the in-memory store no longer has.
    let stale = alice.client.messages.queue().clear()?;
    if stale > 0 {
        tracing::warn!(stale, "discarded queue items from a previous run");
    }
    let bob = participant(&store, &config, "bob", queue::open_queue_db_in_memory()?)?;
    let carol = participant(&store, &config, "carol", queue::open_queue_db_in_memory()?)?;

    alice.client.keys.initialize_keys("alice-password").await?;
    bob.client.keys.initialize_keys("bob-password").await?;
    carol.client.keys.initialize_keys("carol-password").await?;
    store.connect(alice.id, bob.id);
    store.connect(alice.id, carol.id);

    let direct = alice
        .client
        .messages
        .get_or_create_direct_conversation(bob.id)
        .await?;
    alice
        .client
        .messages
        .send_message(SendMessageRequest {
            conversation_id: direct.id,
            content: "Hi Bob, this is end-to-end encrypted.".into(),
        })
        .await?;
    let page = bob
        .client
        .messages
        .get_message_history(direct.id, None, None)
        .await?;
    for message in &page.messages {
        tracing::info!(sequence = message.sequence_number, content = %message.content, "bob reads");
    }

    let group = alice
        .client
        .groups
        .create_group(Some("Ciphertalk demo"), &[bob.id, carol.id])
        .await?;
    carol
        .client
        .messages
        .send_message(SendMessageRequest {
            conversation_id: group.conversation.id,
            content: "Hello group!".into(),
        })
        .await?;

    alice.network.set_online(false);
    let outcome = alice
        .client
        .messages
        .send_message(SendMessageRequest {
            conversation_id: group.conversation.id,
            content: "Written while offline.".into(),
        })
        .await?;
    tracing::info!(queued = outcome.queued(), "alice sent while offline");
    alice.network.set_online(true);
    let drained = alice.client.messages.flush_queue().await?;
    tracing::info!(
        success = drained.success,
        failed = drained.failed,
        skipped = drained.skipped,
        "offline queue drained"
    );

    let page = bob
        .client
        .messages
        .get_message_history(group.conversation.id, None, None)
        .await?;
    for message in page.messages.iter().rev() {
        tracing::info!(sequence = message.sequence_number, content = %message.content, "bob reads group");
    }

    let export = alice.client.gdpr.export_user_data().await?;
    tracing::info!(
        conversations = export.statistics.total_conversations,
        sent = export.statistics.total_messages_sent,
        received = export.statistics.total_messages_received,
        "export complete"
    );
    println!("{}", alice.client.gdpr.export_json().await?);

    alice.client.sign_out().await?;
    bob.client.sign_out().await?;
    carol.client.sign_out().await?;
    Ok(())
}
