//! The asynchronous client façade over one worker connection.
//!
//! The client owns both threads of the pair: the worker loop hosting the
//! guest, and a receiver loop that serves the worker's `callMain`
//! messages and resolves replies. Outgoing calls are serialised by a
//! binary semaphore, so a connection carries at most one call at a time.

use crate::buffer::TransferBuffer;
use crate::host::MainDispatcher;
use crate::messages::{Message, MessageParam, INIT_CHANNEL};
use crate::worker::{run_worker, WorkerConnection};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use wasmbridge_abi::{CallContext, CanonicalOptions, ResourceRegistry, World};
use wasmbridge_runtime::WasmEngine;

/// Configuration for a worker connection.
#[derive(Clone)]
pub struct WorkerClientOptions {
    /// How long the worker waits on a `callMain` reply before trapping.
    pub call_timeout: Option<Duration>,
    /// The byte size of each transfer buffer, header included.
    pub buffer_size: u32,
    /// When set, out-of-line data travels through a second buffer instead
    /// of the header buffer, for guests whose memory the main thread
    /// cannot see.
    pub separate_data_buffer: bool,
    /// The marshalling options handed to the worker at initialisation.
    pub canonical: CanonicalOptions,
}

impl Default for WorkerClientOptions {
    fn default() -> WorkerClientOptions {
        WorkerClientOptions {
            call_timeout: Some(Duration::from_secs(5)),
            buffer_size: 64 * 1024,
            separate_data_buffer: false,
            canonical: CanonicalOptions::new(),
        }
    }
}

type Reply = std::result::Result<Option<MessageParam>, String>;

#[derive(Default)]
struct PendingReplies {
    init: Option<tokio::sync::oneshot::Sender<Reply>>,
    calls: HashMap<String, tokio::sync::oneshot::Sender<Reply>>,
}

/// A locked, request-at-a-time async façade over a worker-hosted guest.
pub struct WorkerClient {
    dispatcher: Arc<MainDispatcher>,
    options: WorkerClientOptions,
    to_worker: Mutex<Option<Sender<Message>>>,
    pending: Arc<Mutex<PendingReplies>>,
    call_lock: tokio::sync::Mutex<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerClient {
    /// Spawns the worker pair for `world` on the given engine. The guest
    /// is not instantiated until [`WorkerClient::initialize`].
    pub fn new(
        engine: Arc<dyn WasmEngine>,
        world: World,
        options: WorkerClientOptions,
    ) -> WorkerClient {
        let (to_worker, from_main) = channel::<Message>();
        let (to_main, from_worker) = channel::<Message>();

        let buffer = TransferBuffer::new(options.buffer_size);
        let data_buffer = options
            .separate_data_buffer
            .then(|| TransferBuffer::new(options.buffer_size));
        let connection = WorkerConnection::new(
            0,
            buffer.clone(),
            data_buffer,
            to_main.clone(),
            options.call_timeout,
        );

        let main_cx = CallContext::new(options.canonical.clone(), ResourceRegistry::new());
        let dispatcher = Arc::new(MainDispatcher::new(main_cx));
        let pending: Arc<Mutex<PendingReplies>> = Arc::new(Mutex::new(PendingReplies::default()));

        let worker = {
            let world = Arc::new(world);
            std::thread::spawn(move || {
                run_worker(engine, world, connection, from_main, to_main);
            })
        };

        let receiver = {
            let dispatcher = dispatcher.clone();
            let pending = pending.clone();
            std::thread::spawn(move || {
                for message in from_worker {
                    match message {
                        Message::CallMain {
                            name,
                            params,
                            memory,
                        } => {
                            dispatcher.dispatch(&name, &params, &memory, &buffer);
                        }
                        Message::ReportResult {
                            name,
                            result,
                            error,
                        } => {
                            let reply = match error {
                                Some(error) => Err(error),
                                None => Ok(result),
                            };
                            let slot = {
                                let mut pending =
                                    pending.lock().unwrap_or_else(|e| e.into_inner());
                                if name == INIT_CHANNEL {
                                    pending.init.take()
                                } else {
                                    pending.calls.remove(&name)
                                }
                            };
                            match slot {
                                Some(tx) => {
                                    let _ = tx.send(reply);
                                }
                                None => log::warn!("unsolicited reply for `{name}`"),
                            }
                        }
                        other @ (Message::CallWorker { .. }
                        | Message::InitializeWorker { .. }) => {
                            log::warn!(
                                "unexpected message `{}` on the main side",
                                name_of(&other)
                            );
                        }
                    }
                }
            })
        };

        WorkerClient {
            dispatcher,
            options,
            to_worker: Mutex::new(Some(to_worker)),
            pending,
            call_lock: tokio::sync::Mutex::new(()),
            threads: Mutex::new(vec![worker, receiver]),
        }
    }

    /// The handler registry served to the worker's `callMain` messages.
    pub fn handlers(&self) -> &Arc<MainDispatcher> {
        &self.dispatcher
    }

    fn send(&self, message: Message) -> Result<()> {
        let guard = self.to_worker.lock().unwrap_or_else(|e| e.into_inner());
        let sender = guard.as_ref().context("client is disposed")?;
        sender
            .send(message)
            .map_err(|_| anyhow::anyhow!("worker is gone"))
    }

    /// Instantiates and binds the module inside the worker.
    pub async fn initialize(&self, module: Vec<u8>) -> Result<()> {
        let _guard = self.call_lock.lock().await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.init.is_some() {
                bail!("initialisation already in flight");
            }
            pending.init = Some(tx);
        }
        self.send(Message::InitializeWorker {
            module,
            options: self.options.canonical.clone(),
        })?;
        match rx.await.context("worker terminated during initialisation")? {
            Ok(_) => Ok(()),
            Err(error) => bail!("worker initialisation failed: {error}"),
        }
    }

    /// Invokes an exported guest function by name. Calls are serialised;
    /// a connection carries one call at a time.
    pub async fn call_worker(
        &self,
        name: &str,
        params: Vec<MessageParam>,
    ) -> Result<Option<MessageParam>> {
        let _guard = self.call_lock.lock().await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.calls.contains_key(name) {
                return Err(wasmbridge_abi::Trap::CallInFlight.into());
            }
            pending.calls.insert(name.to_string(), tx);
        }
        self.send(Message::CallWorker {
            name: name.to_string(),
            params,
        })?;
        match rx.await.context("worker terminated during the call")? {
            Ok(result) => Ok(result),
            Err(error) => bail!("worker call `{name}` failed: {error}"),
        }
    }

    /// Tears the worker down. Outstanding calls fail; further calls
    /// error.
    pub fn dispose(&self) {
        self.to_worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let threads = {
            let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *threads)
        };
        for thread in threads {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn name_of(message: &Message) -> &str {
    match message {
        Message::CallMain { name, .. }
        | Message::ReportResult { name, .. }
        | Message::CallWorker { name, .. } => name,
        Message::InitializeWorker { .. } => INIT_CHANNEL,
    }
}
