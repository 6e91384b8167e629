//! 会话多路复用
//!
//! 客户端整个进程只维护一个会话，所有逻辑流共享它。
//! 会话状态：Empty → (拨号中) → Ready，开流失败后回到 Empty，下一次开流重新拨号。

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_smux::{MuxAcceptor, MuxBuilder, MuxConnector};
use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::transport::{BoxedConnection, Transport};

pub type MuxStream = async_smux::MuxStream<BoxedConnection>;

struct Session {
    connector: MuxConnector<BoxedConnection>,
    _acceptor: MuxAcceptor<BoxedConnection>,
    closed: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl Session {
    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// 客户端侧的会话管理器
pub struct Multiplexer {
    transport: Arc<dyn Transport>,
    server_addr: String,
    dial_timeout: Duration,
    // 已建立的会话，开流时只读
    current: RwLock<Option<Arc<Session>>>,
    // 只在创建会话时持有
    dialing: Mutex<()>,
    // 每次拨号失败加一，排在失败拨号后面的调用一起失败
    failures: AtomicU64,
    dials: AtomicUsize,
}

impl Multiplexer {
    pub fn new(transport: Arc<dyn Transport>, server_addr: impl Into<String>, dial_timeout: Duration) -> Self {
        Self {
            transport,
            server_addr: server_addr.into(),
            dial_timeout,
            current: RwLock::new(None),
            dialing: Mutex::new(()),
            failures: AtomicU64::new(0),
            dials: AtomicUsize::new(0),
        }
    }

    /// 在当前会话上打开一条新的逻辑流，没有可用会话时先拨号
    pub async fn open_stream(&self) -> Result<MuxStream> {
        let observed = self.failures.load(Ordering::Acquire);
        let session = match self.live_session() {
            Some(session) => session,
            None => self.establish(observed).await?,
        };

        match session.connector.connect() {
            Ok(stream) => Ok(stream),
            Err(e) => {
                warn!("打开逻辑流失败，丢弃会话: {:?}", e);
                self.discard(&session);
                Err(Error::transport(format!("open stream: {e:?}")))
            }
        }
    }

    /// 当前是否持有一个存活的会话
    pub fn is_ready(&self) -> bool {
        self.live_session().is_some()
    }

    /// 累计拨号次数
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::Relaxed)
    }

    fn live_session(&self) -> Option<Arc<Session>> {
        self.current.read().as_ref().filter(|session| session.is_alive()).cloned()
    }

    async fn establish(&self, observed: u64) -> Result<Arc<Session>> {
        let _dialing = self.dialing.lock().await;
        // 排队期间别的调用可能已经建好会话
        if let Some(session) = self.live_session() {
            return Ok(session);
        }
        if self.failures.load(Ordering::Acquire) != observed {
            return Err(Error::transport("session dial failed"));
        }
        *self.current.write() = None;
        match self.connect().await {
            Ok(session) => {
                let session = Arc::new(session);
                *self.current.write() = Some(Arc::clone(&session));
                Ok(session)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    fn discard(&self, failed: &Arc<Session>) {
        let mut current = self.current.write();
        if current.as_ref().is_some_and(|session| Arc::ptr_eq(session, failed)) {
            *current = None;
        }
    }

    async fn connect(&self) -> Result<Session> {
        self.dials.fetch_add(1, Ordering::Relaxed);
        let conn = tokio::time::timeout(self.dial_timeout, self.transport.dial(&self.server_addr))
            .await
            .map_err(|_| Error::transport(format!("dial {} timed out", self.server_addr)))??;
        info!("会话已建立: {}", self.server_addr);

        let mut builder = MuxBuilder::client();
        let (connector, acceptor, worker) = builder.with_connection(conn).build();

        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let worker = tokio::spawn(async move {
            if let Err(e) = worker.await {
                debug!("会话结束: {:?}", e);
            }
            flag.store(true, Ordering::Release);
        });

        Ok(Session {
            connector,
            _acceptor: acceptor,
            closed,
            worker,
        })
    }
}

/// 服务端：在一条底层连接上接受逻辑流，每条流交给独立的任务处理
pub async fn serve<F, Fut>(conn: BoxedConnection, handler: F)
where
    F: Fn(MuxStream) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut builder = MuxBuilder::server();
    let (_connector, mut acceptor, worker) = builder.with_connection(conn).build();
    let worker = tokio::spawn(async move {
        if let Err(e) = worker.await {
            debug!("会话结束: {:?}", e);
        }
    });

    while let Some(stream) = acceptor.accept().await {
        tokio::spawn(handler(stream));
    }
    worker.abort();
}
