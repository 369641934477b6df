//! Operator approval of client tokens.
//!
//! An unseen token suspends only the session that presented it. The request
//! is queued for the operator; every session waiting on the same token gets
//! the same answer. Approved tokens stay trusted for the life of the process
//! and are never written to disk. A rejection is not remembered, so the next
//! connection with that token is asked about again.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

#[derive(Default)]
struct TrustState {
    approved: HashSet<String>,
    pending: HashMap<String, Vec<oneshot::Sender<bool>>>,
}

struct Inner {
    state: Mutex<TrustState>,
    requests: mpsc::UnboundedSender<ApprovalRequest>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TrustState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, token: &str, approved: bool) {
        let waiters = {
            let mut state = self.lock();
            if approved {
                state.approved.insert(token.to_string());
            }
            state.pending.remove(token).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(approved);
        }
    }
}

/// Process-lifetime set of approved tokens plus the pending-approval queue.
#[derive(Clone)]
pub struct TrustGate {
    inner: Arc<Inner>,
}

impl TrustGate {
    /// Returns the gate and the queue the operator answers from.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ApprovalRequest>) {
        let (requests, rx) = mpsc::unbounded_channel();
        let gate = Self {
            inner: Arc::new(Inner {
                state: Mutex::default(),
                requests,
            }),
        };
        (gate, rx)
    }

    pub fn is_approved(&self, token: &str) -> bool {
        self.inner.lock().approved.contains(token)
    }

    /// Trust `token`. Idempotent; also releases sessions waiting on it.
    pub fn approve(&self, token: &str) {
        self.inner.settle(token, true);
    }

    /// Wait for a decision on `token`. Returns immediately if already approved.
    pub async fn authorize(&self, token: &str) -> bool {
        let (decision, first) = {
            let mut state = self.inner.lock();
            if state.approved.contains(token) {
                return true;
            }
            let (tx, rx) = oneshot::channel();
            let waiters = state.pending.entry(token.to_string()).or_default();
            waiters.push(tx);
            (rx, waiters.len() == 1)
        };

        if first {
            info!(token, "Awaiting operator approval");
            let request = ApprovalRequest {
                token: token.to_string(),
                gate: Arc::downgrade(&self.inner),
                decided: false,
            };
            // A closed queue drops the request, which rejects it.
            let _ = self.inner.requests.send(request);
        }

        decision.await.unwrap_or(false)
    }
}

/// One token awaiting an operator decision. Dropping it undecided rejects.
pub struct ApprovalRequest {
    token: String,
    gate: Weak<Inner>,
    decided: bool,
}

impl ApprovalRequest {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// True when every session that asked has since gone away.
    pub fn is_stale(&self) -> bool {
        let Some(inner) = self.gate.upgrade() else {
            return true;
        };
        let state = inner.lock();
        state
            .pending
            .get(&self.token)
            .map_or(true, |waiters| waiters.iter().all(|w| w.is_closed()))
    }

    pub fn approve(self) {
        self.decide(true);
    }

    pub fn reject(self) {
        self.decide(false);
    }

    fn decide(mut self, approved: bool) {
        self.decided = true;
        if let Some(inner) = self.gate.upgrade() {
            info!(token = %self.token, approved, "Operator decision");
            inner.settle(&self.token, approved);
        }
    }
}

impl Drop for ApprovalRequest {
    fn drop(&mut self) {
        if !self.decided {
            if let Some(inner) = self.gate.upgrade() {
                inner.settle(&self.token, false);
            }
        }
    }
}

/// Answer approval requests one at a time from a line-oriented console.
///
/// Only `yes` (any case) approves. If the input closes, every remaining
/// request is rejected.
pub async fn run_operator<R, W>(
    mut requests: mpsc::UnboundedReceiver<ApprovalRequest>,
    input: R,
    mut output: W,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut input_open = true;

    while let Some(request) = requests.recv().await {
        if request.is_stale() {
            request.reject();
            continue;
        }
        if !input_open {
            request.reject();
            continue;
        }

        let prompt = format!(
            "Do you confirm the execution for UUID: {}? (yes/no): ",
            request.token()
        );
        if output.write_all(prompt.as_bytes()).await.is_err() || output.flush().await.is_err() {
            warn!("Operator console is not writable; rejecting");
            request.reject();
            continue;
        }

        match lines.next_line().await {
            Ok(Some(answer)) if answer.trim().eq_ignore_ascii_case("yes") => request.approve(),
            Ok(Some(_)) => request.reject(),
            Ok(None) | Err(_) => {
                warn!("Operator console closed; rejecting unapproved tokens from now on");
                input_open = false;
                request.reject();
            }
        }
    }
}

/// [`run_operator`] on the process's stdin/stdout.
pub async fn run_console_operator(requests: mpsc::UnboundedReceiver<ApprovalRequest>) {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    run_operator(requests, stdin, tokio::io::stdout()).await;
}
