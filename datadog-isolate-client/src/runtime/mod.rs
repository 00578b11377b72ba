// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-runtime façades. Each submodule method translates into one request
//! frame; `fetch.dispatch` may additionally open an upload stream.

pub(crate) mod console;
pub(crate) mod fetch;
pub(crate) mod playwright;
pub(crate) mod test_env;
pub(crate) mod timers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use datadog_isolate_ipc::msg::{
    self, CallbackRegistration, CreateRuntime, DisposeRuntime, Message, RuntimeOptions,
};
use futures::FutureExt;

use crate::callbacks::{CallbackDescriptor, CallbackKind, CallbackTarget};
use crate::config::{EvalOptions, FunctionSpec, PlaywrightLifecycleHook, RuntimeConfig};
use crate::connection::ConnectionCore;
use crate::error::{CallbackError, ClientError};
use crate::marshal::Value;
use crate::pending::RpcOutcome;
use crate::websocket::{WsSubscriber, WsSubscription};

pub use console::ConsoleHandle;
pub use fetch::{FetchHandle, UpgradeResult};
pub use playwright::PlaywrightHandle;
pub use test_env::{TestEnvironmentHandle, TestRunReport};
pub use timers::TimersHandle;

pub(crate) struct RuntimeInner {
    pub(crate) core: Arc<ConnectionCore>,
    pub(crate) runtime_id: u64,
    pub(crate) reused: bool,
    pub(crate) test_enabled: bool,
    callback_ids: Vec<u64>,
    playwright_detach: Option<PlaywrightLifecycleHook>,
    disposed: AtomicBool,
}

impl RuntimeInner {
    fn cleanup_local(&self) {
        self.core.ws_router.drop_runtime(self.runtime_id);
        for callback_id in &self.callback_ids {
            self.core.callbacks.remove(*callback_id);
        }
        if let Some(detach) = &self.playwright_detach {
            detach(self.runtime_id);
        }
    }
}

/// Handle to one isolate inside the daemon.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("runtime_id", &self.inner.runtime_id)
            .field("reused", &self.inner.reused)
            .finish()
    }
}

impl Runtime {
    pub(crate) async fn create(
        core: Arc<ConnectionCore>,
        config: RuntimeConfig,
    ) -> Result<Runtime, ClientError> {
        let (registration, callback_ids) = register_callbacks(&core, &config);

        let options = RuntimeOptions {
            memory_limit_mb: config.memory_limit_mb,
            working_dir: config
                .working_dir
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            namespace: config.namespace.clone(),
            test_environment: config.test_environment.wire_options(),
            callbacks: registration,
        };
        let request_id = core.ids.next_request();
        let message = Message::CreateRuntime(CreateRuntime {
            request_id,
            options,
        });
        let timeout = core.request_timeout;
        match core.request(request_id, message, timeout).await {
            Ok(RpcOutcome::RuntimeCreated { runtime_id, reused }) => {
                if let Some(playwright) = &config.playwright {
                    if let Some(attach) = &playwright.on_attach {
                        attach(runtime_id);
                    }
                }
                Ok(Runtime {
                    inner: Arc::new(RuntimeInner {
                        core,
                        runtime_id,
                        reused,
                        test_enabled: config.test_environment.enabled(),
                        callback_ids,
                        playwright_detach: config
                            .playwright
                            .as_ref()
                            .and_then(|p| p.on_detach.clone()),
                        disposed: AtomicBool::new(false),
                    }),
                })
            }
            Ok(other) => {
                for callback_id in callback_ids {
                    core.callbacks.remove(callback_id);
                }
                Err(ClientError::Protocol(format!(
                    "unexpected create-runtime response {other:?}"
                )))
            }
            Err(e) => {
                for callback_id in callback_ids {
                    core.callbacks.remove(callback_id);
                }
                Err(e)
            }
        }
    }

    pub fn runtime_id(&self) -> u64 {
        self.inner.runtime_id
    }

    /// True when the daemon satisfied the creation from an existing
    /// namespaced isolate.
    pub fn was_reused(&self) -> bool {
        self.inner.reused
    }

    /// Evaluates `source` as a module. Module evaluation does not produce
    /// a value; the response only signals completion.
    pub async fn eval(&self, source: &str, options: EvalOptions) -> Result<(), ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::Eval(msg::Eval {
            request_id,
            runtime_id: self.inner.runtime_id,
            source: source.to_owned(),
            filename: options.filename,
            max_duration_ms: options.max_duration.map(|d| d.as_millis() as u64),
        });
        // leave the isolate its full execution time before the RPC times out
        let timeout = core.request_timeout + options.max_duration.unwrap_or_default();
        core.request(request_id, message, timeout).await?;
        Ok(())
    }

    /// Disposes the isolate and detaches everything this handle installed.
    /// Outstanding requests against it complete (or time out) naturally.
    pub async fn dispose(&self) -> Result<(), ClientError> {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::DisposeRuntime(DisposeRuntime {
            request_id,
            runtime_id: self.inner.runtime_id,
        });
        let result = core.request(request_id, message, core.request_timeout).await;
        self.inner.cleanup_local();
        result.map(|_| ())
    }

    pub fn fetch(&self) -> FetchHandle {
        FetchHandle::new(self.inner.clone())
    }

    pub fn timers(&self) -> TimersHandle {
        TimersHandle::new(self.inner.clone())
    }

    pub fn console(&self) -> ConsoleHandle {
        ConsoleHandle::new(self.inner.clone())
    }

    pub fn test_environment(&self) -> TestEnvironmentHandle {
        TestEnvironmentHandle::new(self.inner.clone())
    }

    pub fn playwright(&self) -> PlaywrightHandle {
        PlaywrightHandle::new(self.inner.clone())
    }

    /// Registers a subscriber for WebSocket commands pushed by this
    /// runtime's isolate.
    pub fn subscribe_ws_commands(&self, subscriber: WsSubscriber) -> WsSubscription {
        let token = self
            .inner
            .core
            .ws_router
            .subscribe(self.inner.runtime_id, subscriber);
        WsSubscription {
            router: self.inner.core.ws_router.clone(),
            runtime_id: self.inner.runtime_id,
            token,
        }
    }
}

/// Registers every hook the config carries and returns the id package for
/// the `create-runtime` request plus the ids to drop on disposal.
fn register_callbacks(
    core: &Arc<ConnectionCore>,
    config: &RuntimeConfig,
) -> (CallbackRegistration, Vec<u64>) {
    let mut ids = Vec::new();
    let mut register = |descriptor: CallbackDescriptor| {
        let callback_id = core.ids.next_callback();
        core.callbacks.register(callback_id, descriptor);
        ids.push(callback_id);
        callback_id
    };

    let mut registration = CallbackRegistration::default();
    if let Some(console) = &config.console {
        registration.console = Some(register(CallbackDescriptor {
            kind: CallbackKind::SyncEffect,
            target: CallbackTarget::Hook(console.clone()),
        }));
    }
    if let Some(fetch) = &config.fetch {
        registration.fetch = Some(register(CallbackDescriptor {
            kind: CallbackKind::Fetch,
            target: CallbackTarget::Fetch(fetch.clone()),
        }));
    }
    if let Some(fs) = &config.fs {
        registration.fs = Some(register(CallbackDescriptor {
            kind: CallbackKind::Async,
            target: CallbackTarget::Hook(fs.clone()),
        }));
    }
    if let Some(loader) = &config.module_loader {
        registration.module_loader = Some(register(CallbackDescriptor {
            kind: CallbackKind::Async,
            target: CallbackTarget::Hook(caching_module_loader(core, loader.clone())),
        }));
    }
    if let Some(test_event) = &config.test_event {
        registration.test_event = Some(register(CallbackDescriptor {
            kind: CallbackKind::SyncEffect,
            target: CallbackTarget::Hook(test_event.clone()),
        }));
    }
    if let Some(playwright) = &config.playwright {
        registration.playwright = Some(register(CallbackDescriptor {
            kind: CallbackKind::Async,
            target: CallbackTarget::Hook(playwright.handler.clone()),
        }));
    }
    for (name, spec) in &config.functions {
        match spec {
            FunctionSpec::Function(function) => {
                let callback_id = register(CallbackDescriptor {
                    kind: CallbackKind::Async,
                    target: CallbackTarget::Hook(function.clone()),
                });
                registration.functions.insert(name.clone(), callback_id);
            }
            FunctionSpec::AsyncIterator(factory) => {
                let start = register(CallbackDescriptor {
                    kind: CallbackKind::IteratorStart,
                    target: CallbackTarget::IteratorFactory(factory.clone()),
                });
                let next = register(CallbackDescriptor {
                    kind: CallbackKind::IteratorNext,
                    target: CallbackTarget::IteratorStep,
                });
                let ret = register(CallbackDescriptor {
                    kind: CallbackKind::IteratorReturn,
                    target: CallbackTarget::IteratorStep,
                });
                let throw = register(CallbackDescriptor {
                    kind: CallbackKind::IteratorThrow,
                    target: CallbackTarget::IteratorStep,
                });
                registration.functions.insert(format!("{name}:start"), start);
                registration.functions.insert(format!("{name}:next"), next);
                registration.functions.insert(format!("{name}:return"), ret);
                registration.functions.insert(format!("{name}:throw"), throw);
            }
        }
    }
    (registration, ids)
}

/// Wraps the user module loader with the connection's module-source cache.
/// Captures the core weakly; the registry lives on the core itself.
fn caching_module_loader(
    core: &Arc<ConnectionCore>,
    loader: crate::config::ModuleLoader,
) -> crate::marshal::HostFunction {
    let core = Arc::downgrade(core);
    Arc::new(move |args: Vec<Value>| {
        let specifier = args
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let core = core.clone();
        let loader = loader.clone();
        async move {
            if specifier.is_empty() {
                return Err(CallbackError::new(
                    "TypeError",
                    "module loader invoked without a specifier",
                ));
            }
            if let Some(core) = core.upgrade() {
                let cached = core.module_cache.lock().unwrap().get(&specifier).cloned();
                if let Some(source) = cached {
                    return Ok(Value::String(source));
                }
            }
            let source = loader(specifier.clone()).await?;
            if let Some(core) = core.upgrade() {
                core.module_cache
                    .lock()
                    .unwrap()
                    .insert(specifier, source.clone());
            }
            Ok(Value::String(source))
        }
        .boxed()
    })
}
