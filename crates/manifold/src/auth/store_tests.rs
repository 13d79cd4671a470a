use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::time::{advance, Duration, Instant};

use super::*;
use crate::auth::OAuth2ErrorCode;

fn token(access: &str, expires_in: Duration) -> TokenData {
	TokenData::new(access, "Bearer", Instant::now() + expires_in)
}

#[tokio::test(start_paused = true)]
async fn test_store_trims_and_retrieves() {
	let store = TokenStore::default();
	store
		.store(TokenData::new("  tok  ", " Bearer ", Instant::now() + Duration::from_secs(3600)))
		.expect("store should accept the token");
	let retrieved = store.retrieve().expect("token should be present");
	assert_eq!(retrieved.access_token(), "tok");
	assert_eq!(retrieved.token_type(), "Bearer");
}

#[tokio::test(start_paused = true)]
async fn test_store_rejects_empty_tokens() {
	let store = TokenStore::default();
	let err = store
		.store(token("   ", Duration::from_secs(3600)))
		.expect_err("blank access token must be rejected");
	assert_eq!(err.code, OAuth2ErrorCode::InvalidRequest);
	let err = store
		.store(TokenData::new("tok", "", Instant::now() + Duration::from_secs(3600)))
		.expect_err("blank token type must be rejected");
	assert_eq!(err.code, OAuth2ErrorCode::InvalidRequest);
}

#[tokio::test(start_paused = true)]
async fn test_expiry_buffer_window() {
	let store = TokenStore::default();

	// No token at all: expired.
	assert!(store.is_expired());

	// Expiry inside the buffer window: reported expired to force a
	// proactive refresh.
	store
		.store(token("tok", EXPIRY_BUFFER - Duration::from_secs(1)))
		.expect("store");
	assert!(store.is_expired());

	// Expiry beyond the buffer: valid.
	store
		.store(token("tok", EXPIRY_BUFFER + Duration::from_secs(60)))
		.expect("store");
	assert!(!store.is_expired());
}

#[tokio::test(start_paused = true)]
async fn test_expired_token_is_storable_but_expired() {
	let store = TokenStore::default();
	store
		.store(TokenData::new(
			"tok",
			"Bearer",
			Instant::now() - Duration::from_secs(1),
		))
		.expect("an already expired token is still storable");
	assert!(store.is_expired());
}

#[tokio::test(start_paused = true)]
async fn test_clear_removes_token() {
	let store = TokenStore::default();
	store.store(token("tok", Duration::from_secs(3600))).expect("store");
	store.clear();
	assert!(store.retrieve().is_none());
	assert!(store.is_expired());
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_refresh_fires_at_buffer_boundary() {
	let store = TokenStore::default();
	let fired = Arc::new(AtomicUsize::new(0));
	let fired_clone = fired.clone();
	store.schedule_refresh(move || {
		let fired = fired_clone.clone();
		Box::pin(async move {
			fired.fetch_add(1, Ordering::SeqCst);
			Ok(())
		})
	});
	store
		.store(token("tok", Duration::from_secs(3600)))
		.expect("store");

	// Just before expiry - buffer: nothing yet.
	advance(Duration::from_secs(3600) - EXPIRY_BUFFER - Duration::from_secs(1)).await;
	assert_eq!(fired.load(Ordering::SeqCst), 0);

	advance(Duration::from_secs(2)).await;
	tokio::task::yield_now().await;
	assert_eq!(fired.load(Ordering::SeqCst), 1);

	// A single timer only.
	advance(Duration::from_secs(7200)).await;
	tokio::task::yield_now().await;
	assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_replacing_token_cancels_prior_timer() {
	let store = TokenStore::default();
	let fired = Arc::new(AtomicUsize::new(0));
	let fired_clone = fired.clone();
	store.schedule_refresh(move || {
		let fired = fired_clone.clone();
		Box::pin(async move {
			fired.fetch_add(1, Ordering::SeqCst);
			Ok(())
		})
	});
	store
		.store(token("first", Duration::from_secs(600)))
		.expect("store");
	store
		.store(token("second", Duration::from_secs(7200)))
		.expect("store");

	// Past the first token's refresh point: its timer must be gone.
	advance(Duration::from_secs(600)).await;
	tokio::task::yield_now().await;
	assert_eq!(fired.load(Ordering::SeqCst), 0);

	advance(Duration::from_secs(7200)).await;
	tokio::task::yield_now().await;
	assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_failures_are_swallowed() {
	let store = TokenStore::default();
	store.schedule_refresh(move || {
		Box::pin(async move {
			Err(AuthError::network("token endpoint unreachable"))
		})
	});
	store
		.store(token("tok", Duration::from_secs(3600)))
		.expect("store");
	advance(Duration::from_secs(3600)).await;
	tokio::task::yield_now().await;
	// Still holding the (now expired) token; the failure did not panic or
	// clear anything.
	assert!(store.retrieve().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_store_retrieve_is_consistent() {
	let store = Arc::new(TokenStore::default());
	let writer = {
		let store = store.clone();
		tokio::spawn(async move {
			for i in 0..100 {
				store
					.store(token(&format!("tok-{i}"), Duration::from_secs(3600)))
					.expect("store");
			}
		})
	};
	let reader = {
		let store = store.clone();
		tokio::spawn(async move {
			for _ in 0..100 {
				if let Some(t) = store.retrieve() {
					assert!(t.access_token().starts_with("tok-"), "no torn reads");
				}
				tokio::task::yield_now().await;
			}
		})
	};
	writer.await.expect("writer");
	reader.await.expect("reader");
}
