//! Idempotent request layer.
//!
//! Wraps the network client so every state-mutating call carries a
//! client-generated idempotency token, and so retries of the same logical
//! operation — including retries after a timeout, and retries in a later
//! process after the token was persisted — reuse that token. A fresh token
//! is generated only when a genuinely new logical operation first asks for
//! one.
//!
//! The layer does not itself make replays server-side no-ops (that is a
//! server property); it guarantees the token discipline the server property
//! depends on.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use cachet_types::{ConvoId, IdempotencyKey, RetryPolicy};
use tracing::warn;

use crate::{
    env::Environment,
    error::CoreError,
    net::{NetError, NetworkClient},
};

/// Identity of a logical operation.
///
/// Two calls with the same `OperationKey` are the same logical operation
/// and must share a token; distinct keys are distinct operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationKey {
    /// Creating a conversation.
    CreateConversation {
        /// Conversation being created.
        convo: ConvoId,
    },
    /// The membership commit targeting a specific epoch.
    Membership {
        /// Conversation being changed.
        convo: ConvoId,
        /// Epoch the commit will create. A re-built commit for the next
        /// epoch is a new logical operation.
        target_epoch: u64,
    },
    /// Sending the message with a specific sequence number.
    SendMessage {
        /// Destination conversation.
        convo: ConvoId,
        /// Sequence number of the message.
        seq: u64,
    },
    /// Publishing a specific key package.
    PublishKeyPackage {
        /// Hash reference of the package.
        hash_ref: Vec<u8>,
    },
    /// Confirming the welcome for a conversation.
    ConfirmWelcome {
        /// Conversation the welcome was for.
        convo: ConvoId,
    },
    /// Rejoining a conversation.
    Rejoin {
        /// Conversation being rejoined.
        convo: ConvoId,
    },
}

/// Network client wrapper enforcing token reuse and bounded retry.
pub struct IdempotentClient<N: NetworkClient, E: Environment> {
    inner: N,
    env: E,
    policy: RetryPolicy,
    tokens: Mutex<HashMap<OperationKey, IdempotencyKey>>,
}

impl<N: NetworkClient, E: Environment> IdempotentClient<N, E> {
    /// Wrap a network client.
    pub fn new(inner: N, env: E, policy: RetryPolicy) -> Self {
        Self { inner, env, policy, tokens: Mutex::new(HashMap::new()) }
    }

    /// The wrapped client, for calls that manage their own tokens.
    pub fn inner(&self) -> &N {
        &self.inner
    }

    /// Token for a logical operation, minting one on first use.
    pub fn token_for(&self, op: &OperationKey) -> IdempotencyKey {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        *tokens.entry(op.clone()).or_insert_with(|| IdempotencyKey(self.env.random_u128()))
    }

    /// Bind a persisted token to an operation (protocol state reloaded
    /// after a restart). Replaces any minted token.
    pub fn assign_token(&self, op: OperationKey, token: IdempotencyKey) {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.insert(op, token);
    }

    /// Forget the token after the operation completed. The next operation
    /// with this key is a new logical operation and gets a fresh token.
    pub fn complete(&self, op: &OperationKey) {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.remove(op);
    }

    /// Run `call` with the operation's token, retrying retryable failures
    /// with the same token and exponential backoff.
    ///
    /// On success the token is forgotten. On final failure the token is
    /// retained, so a later retry of the same logical operation still
    /// replays the original token.
    pub async fn run<T, F, Fut>(&self, op: OperationKey, call: F) -> Result<T, CoreError>
    where
        F: Fn(IdempotencyKey) -> Fut,
        Fut: Future<Output = Result<T, NetError>>,
    {
        let token = self.token_for(&op);
        let mut attempt = 1u32;

        loop {
            match call(token).await {
                Ok(value) => {
                    self.complete(&op);
                    return Ok(value);
                },
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    warn!(%token, attempt, error = %err, "network call failed, retrying");
                    self.env.sleep(self.policy.backoff(attempt)).await;
                    attempt += 1;
                },
                Err(err) => return Err(CoreError::Network(err)),
            }
        }
    }
}
