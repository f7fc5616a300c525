//! Process-wide termination hook.
//!
//! Each running container registers a kill action here. The first
//! registration spawns a listener for SIGINT/SIGTERM; when one arrives every
//! registered action runs (each sends KILL to its worker) and the process
//! exits with [`EXIT_ON_SIGNAL`]. This keeps workers from outliving an
//! interrupted harness.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use tokio::task::JoinHandle;

/// Exit status after running the hooks, as a shell reports an interrupt.
pub const EXIT_ON_SIGNAL: i32 = 130;

/// Bound on running all kill actions once a signal arrived.
pub const HOOK_RUN_TIMEOUT: Duration = Duration::from_secs(5);

type KillAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    actions: BTreeMap<u64, KillAction>,
    listener: Option<JoinHandle<()>>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Registry::default()))
}

/// Keeps a kill action registered until deregistered or dropped.
#[derive(Debug)]
pub struct HookRegistration {
    id: Option<u64>,
}

impl HookRegistration {
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Remove the action. Returns whether it was still registered.
    pub fn deregister(mut self) -> bool {
        self.remove()
    }

    fn remove(&mut self) -> bool {
        let Some(id) = self.id.take() else {
            return false;
        };
        match registry().lock() {
            Ok(mut registry) => registry.actions.remove(&id).is_some(),
            Err(_) => false,
        }
    }
}

impl Drop for HookRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Register `action` to run on SIGINT/SIGTERM.
///
/// Outside a tokio runtime the action is still recorded but no listener is
/// started until a later registration happens inside one.
pub fn register<F, Fut>(action: F) -> HookRegistration
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let action: KillAction = Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(action()) });

    let Ok(mut registry) = registry().lock() else {
        tracing::warn!("Termination hook registry poisoned, hook not registered");
        return HookRegistration { id: None };
    };

    let id = registry.next_id;
    registry.next_id += 1;
    registry.actions.insert(id, action);

    let listening = registry
        .listener
        .as_ref()
        .is_some_and(|task| !task.is_finished());
    if !listening {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => registry.listener = Some(handle.spawn(listen())),
            Err(_) => tracing::debug!("No tokio runtime, termination listener deferred"),
        }
    }

    tracing::trace!(id, registered = registry.actions.len(), "Registered termination hook");
    HookRegistration { id: Some(id) }
}

/// Number of actions currently registered.
pub fn registered() -> usize {
    registry().lock().map(|r| r.actions.len()).unwrap_or(0)
}

/// Run every registered action once, bounded by [`HOOK_RUN_TIMEOUT`].
pub async fn run_registered() {
    let actions: Vec<KillAction> = match registry().lock() {
        Ok(registry) => registry.actions.values().cloned().collect(),
        Err(_) => return,
    };
    if actions.is_empty() {
        return;
    }

    let count = actions.len();
    let all = join_all(actions.iter().map(|action| action()));
    if tokio::time::timeout(HOOK_RUN_TIMEOUT, all).await.is_err() {
        tracing::warn!(count, "Termination hooks did not finish in time");
    }
}

async fn listen() {
    termination_signal().await;
    tracing::info!(hooks = registered(), "Termination signal received, killing workers");
    run_registered().await;
    std::process::exit(EXIT_ON_SIGNAL);
}

async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::debug!("Received SIGINT"),
        _ = terminate => tracing::debug!("Received SIGTERM"),
    }
}
