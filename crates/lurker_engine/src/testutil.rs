#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lurker_domain::StreamerHandle;
use lurker_kick::{ChatConnection, ChatTransport, ChatroomResolver, ResolvedChannel, ResolverError, TransportError};
use lurker_storage::InMemoryRepository;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::manager::ListenerManager;
use crate::service::ListenService;

pub fn handle(s: &str) -> StreamerHandle {
	StreamerHandle::new(s).expect("valid handle")
}

/// Engine config tuned for fast tests.
pub fn test_config() -> EngineConfig {
	EngineConfig {
		inbound_buffer_size: 16,
		reconnect_interval: Duration::from_millis(10),
		tick_period: Duration::from_millis(20),
		drain_timeout: Duration::from_millis(50),
		storage_timeout: Duration::from_secs(1),
		..EngineConfig::default()
	}
}

/// Poll `cond` until it holds or the timeout elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
	let deadline = tokio::time::Instant::now() + timeout;
	while tokio::time::Instant::now() < deadline {
		if cond() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	cond()
}

/// Resolver that always answers the same thing.
pub struct FixedResolver(pub Result<ResolvedChannel, ResolverError>);

impl FixedResolver {
	pub fn chatroom(id: u64) -> Arc<Self> {
		Arc::new(Self(Ok(ResolvedChannel::bare(id))))
	}

	pub fn not_found() -> Arc<Self> {
		Arc::new(Self(Err(ResolverError::NotFound)))
	}
}

#[async_trait]
impl ChatroomResolver for FixedResolver {
	async fn resolve(&self, _handle: &StreamerHandle) -> Result<ResolvedChannel, ResolverError> {
		self.0.clone()
	}
}

/// What `connect` does once the scripted connections run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyBehavior {
	/// Hand out a connection that never produces a frame.
	Pend,

	/// Fail the connection attempt.
	Fail,
}

type FrameResult = Result<String, TransportError>;

enum ConnScript {
	Fail,
	Open(mpsc::UnboundedReceiver<FrameResult>),
}

/// Transport whose connections are scripted by the test.
pub struct ScriptedTransport {
	scripts: Mutex<VecDeque<ConnScript>>,
	writes: Arc<Mutex<Vec<String>>>,
	connects: AtomicUsize,
	when_empty: EmptyBehavior,
	parked: Mutex<Vec<mpsc::UnboundedSender<FrameResult>>>,
}

impl ScriptedTransport {
	pub fn new(when_empty: EmptyBehavior) -> Arc<Self> {
		Arc::new(Self {
			scripts: Mutex::new(VecDeque::new()),
			writes: Arc::new(Mutex::new(Vec::new())),
			connects: AtomicUsize::new(0),
			when_empty,
			parked: Mutex::new(Vec::new()),
		})
	}

	/// Queue a failing connection attempt.
	pub fn push_failure(&self) {
		self.scripts.lock().push_back(ConnScript::Fail);
	}

	/// Queue a connection; the returned sender feeds its `read` results.
	pub fn push_connection(&self) -> mpsc::UnboundedSender<FrameResult> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.scripts.lock().push_back(ConnScript::Open(rx));
		tx
	}

	/// Every frame written through any connection, in order.
	pub fn writes(&self) -> Vec<String> {
		self.writes.lock().clone()
	}

	pub fn connect_count(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
	async fn connect(&self, _url: &str) -> Result<Box<dyn ChatConnection>, TransportError> {
		self.connects.fetch_add(1, Ordering::SeqCst);

		let script = self.scripts.lock().pop_front();
		let rx = match script {
			Some(ConnScript::Fail) => return Err(TransportError::ConnectFailed("scripted failure".to_string())),
			Some(ConnScript::Open(rx)) => rx,
			None => match self.when_empty {
				EmptyBehavior::Fail => return Err(TransportError::ConnectFailed("no scripted connection".to_string())),
				EmptyBehavior::Pend => {
					let (tx, rx) = mpsc::unbounded_channel();
					self.parked.lock().push(tx);
					rx
				}
			},
		};

		Ok(Box::new(ScriptedConn {
			rx,
			writes: Arc::clone(&self.writes),
		}))
	}
}

struct ScriptedConn {
	rx: mpsc::UnboundedReceiver<FrameResult>,
	writes: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ChatConnection for ScriptedConn {
	async fn write_text(&mut self, frame: &str) -> Result<(), TransportError> {
		self.writes.lock().push(frame.to_string());
		Ok(())
	}

	async fn read(&mut self) -> Result<String, TransportError> {
		match self.rx.recv().await {
			Some(result) => result,
			// Script exhausted: stay silent instead of closing.
			None => std::future::pending().await,
		}
	}

	async fn close(&mut self) {}
}

/// Fully wired engine over in-memory storage and a scripted transport.
pub struct EngineFixture {
	pub manager: Arc<ListenerManager>,
	pub repo: Arc<InMemoryRepository>,
	pub transport: Arc<ScriptedTransport>,
	pub service: ListenService,
}

pub fn fixture(cfg: EngineConfig, transport: Arc<ScriptedTransport>, resolver: Arc<dyn ChatroomResolver>) -> EngineFixture {
	let manager = Arc::new(ListenerManager::new());
	let repo = Arc::new(InMemoryRepository::new());

	let service = ListenService::new(
		Arc::clone(&manager),
		Arc::clone(&repo) as Arc<dyn lurker_storage::ListenerRepository>,
		resolver,
		Arc::clone(&transport) as Arc<dyn ChatTransport>,
		Arc::new(cfg),
	);

	EngineFixture {
		manager,
		repo,
		transport,
		service,
	}
}

/// The scenario frame from the upstream wire format, link included.
pub const CHAT_FRAME: &str = r##"{"event":"App\\Events\\ChatMessageEvent","data":"{\"type\":\"message\",\"id\":\"m1\",\"content\":\"hello https://a.b\",\"sender\":{\"id\":1,\"username\":\"u\",\"identity\":{\"color\":\"#ff0000\"}},\"timestamp\":\"2024-01-01T00:00:00Z\"}"}"##;
