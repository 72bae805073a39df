mod common;

use common::{Harness, PASSWORD};

use ciphertalk_shared::error::ChatError;

#[tokio::test]
async fn fresh_session_unlocks_with_the_same_password() {
    let harness = Harness::new();
    let alice = harness.user_with_keys("alice").await;
    let published = alice.client.keys.get_current_keys().unwrap();

    alice.client.sign_out().await.unwrap();
    assert!(alice.client.keys.get_current_keys().is_none());

    // A second device for the same account.
    let second = harness.user("alice-laptop");
    second.auth.sign_in(
        ciphertalk_client::auth::AuthUser {
            id: alice.id,
            email: "alice@example.com".into(),
        },
        "token-2",
    );
    let unlocked = second.client.keys.derive_keys(PASSWORD).await.unwrap();
    assert_eq!(unlocked.public_key().as_bytes(), published.public_key().as_bytes());
}

#[tokio::test]
async fn wrong_password_is_a_key_mismatch() {
    let harness = Harness::new();
    let alice = harness.user_with_keys("alice").await;
    alice.client.keys.clear_keys();

    let err = alice.client.keys.derive_keys("not the password").await.unwrap_err();
    assert!(matches!(err, ChatError::KeyMismatch));
    assert!(alice.client.keys.get_current_keys().is_none());
}

#[tokio::test]
async fn peers_see_each_others_public_keys() {
    let harness = Harness::new();
    let alice = harness.user_with_keys("alice").await;
    let bob = harness.user("bob");

    assert!(alice.client.keys.get_user_public_key(bob.id).await.unwrap().is_none());

    bob.client.keys.initialize_keys("bob's password").await.unwrap();
    let seen = alice.client.keys.get_user_public_key(bob.id).await.unwrap().unwrap();
    let own = bob.client.keys.get_current_keys().unwrap();
    assert_eq!(seen.as_bytes(), own.public_key().as_bytes());
}

#[tokio::test]
async fn revoked_keys_are_no_longer_published() {
    let harness = Harness::new();
    let alice = harness.user_with_keys("alice").await;
    let bob = harness.user_with_keys("bob").await;

    bob.client.keys.revoke_keys().await.unwrap();
    assert!(bob.client.keys.get_current_keys().is_none());
    assert!(alice.client.keys.get_user_public_key(bob.id).await.unwrap().is_none());

    // Re-initializing after revocation publishes a new key.
    bob.client.keys.initialize_keys("new password").await.unwrap();
    assert!(alice.client.keys.get_user_public_key(bob.id).await.unwrap().is_some());
    assert_eq!(harness.store.key_record_count(bob.id), 2);
}
