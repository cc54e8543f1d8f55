//! Servers.
//!
//! A [`Server`] owns its bound ports and a set of registered completion
//! queues. Incoming calls are matched against armed requests: each
//! [`request_call`](Server::request_call) (or
//! [`request_registered_call`](Server::request_registered_call)) is a
//! one-shot intent that is completed by the next unclaimed incoming call.
//! Calls that arrive while no request is armed wait in a backlog.
//!
//! Lifecycle: `Created` -> `Running` (after [`start`](Server::start)) ->
//! `ShuttingDown` (after the first [`shutdown`](Server::shutdown)) ->
//! `Shutdown` (every accepted call has finished; shutdown tags delivered).

use crate::args::ChannelArgs;
use crate::call::{Call, CallDetails};
use crate::error::{CallError, Error};
use crate::queue::{Completion, QueueInner, RequestedCall};
use crate::status::Status;
use crate::stream::{CallTracker, Effects, InitialPayload, Side, Stream};
use crate::transport::{self, Acceptor, Address};
use crate::{CompletionQueue, StatusCode, Tag};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

/// How a registered method delivers its first request message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadHandling {
    /// The call is delivered as soon as it arrives.
    #[default]
    None,
    /// The call is delivered together with its first request message.
    ReadInitialByteBuffer,
}

/// Handle for a method registered with [`Server::register_method`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisteredMethod {
    server: u64,
    index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    ShuttingDown,
    Shutdown,
}

struct BoundPort {
    address: String,
    bound: Address,
    listener: Option<TcpListener>,
}

struct PendingRequest {
    completion: Completion,
    call_queue: Weak<QueueInner>,
}

struct Incoming {
    stream: Arc<Stream>,
    payload: Option<Bytes>,
}

#[derive(Default)]
struct Matcher {
    requested: VecDeque<PendingRequest>,
    backlog: VecDeque<Incoming>,
}

struct Method {
    method: String,
    host: Option<String>,
    payload: PayloadHandling,
    matcher: Matcher,
}

impl Method {
    fn matches(&self, stream: &Stream) -> bool {
        self.method == stream.method()
            && self.host.as_deref().is_none_or(|host| host == stream.host())
    }
}

/// Work produced under the server lock and run after it is released.
enum Deferred {
    Deliver(Completion, RequestedCall),
    Fail(Completion),
    Finish(Completion),
    Cancel(Arc<Stream>, Status),
    Run(Arc<Stream>, Effects),
}

impl Deferred {
    fn run(self) {
        match self {
            Deferred::Deliver(completion, request) => completion.complete_request(request),
            Deferred::Fail(completion) => completion.complete(false, Vec::new()),
            Deferred::Finish(completion) => completion.complete(true, Vec::new()),
            Deferred::Cancel(stream, status) => {
                stream.cancel(status);
            }
            Deferred::Run(stream, effects) => effects.run(&stream),
        }
    }
}

fn run_all(deferred: Vec<Deferred>) {
    for work in deferred {
        work.run();
    }
}

struct ServerState {
    phase: Phase,
    queues: Vec<Weak<QueueInner>>,
    ports: Vec<BoundPort>,
    general: Matcher,
    methods: Vec<Method>,
    awaiting_payload: HashMap<u64, (Arc<Stream>, usize)>,
    active: HashMap<u64, Weak<Stream>>,
    shutdown_waiters: Vec<Completion>,
}

impl ServerState {
    fn is_registered(&self, queue: &CompletionQueue) -> bool {
        let target = Arc::as_ptr(queue.inner());
        self.queues.iter().any(|q| std::ptr::eq(q.as_ptr(), target))
    }

    fn matcher(&mut self, method: Option<usize>) -> &mut Matcher {
        match method.and_then(|i| self.methods.get_mut(i)) {
            Some(method) => &mut method.matcher,
            None => &mut self.general,
        }
    }
}

struct ServerInner {
    id: u64,
    me: Weak<ServerInner>,
    args: ChannelArgs,
    state: Mutex<ServerState>,
}

impl ServerInner {
    fn tracker(&self) -> Weak<dyn CallTracker> {
        self.me.clone()
    }

    fn acceptor(&self) -> Weak<dyn Acceptor> {
        self.me.clone()
    }

    /// Queue an incoming call and match it against armed requests.
    fn enqueue(
        &self,
        state: &mut ServerState,
        method: Option<usize>,
        incoming: Incoming,
        deferred: &mut Vec<Deferred>,
    ) {
        state.matcher(method).backlog.push_back(incoming);
        self.pump(state, method, deferred);
    }

    /// Pair armed requests with waiting calls.
    fn pump(&self, state: &mut ServerState, method: Option<usize>, deferred: &mut Vec<Deferred>) {
        let mut matched = Vec::new();
        let matcher = state.matcher(method);
        while !matcher.requested.is_empty() && !matcher.backlog.is_empty() {
            let (Some(request), Some(incoming)) =
                (matcher.requested.pop_front(), matcher.backlog.pop_front())
            else {
                break;
            };
            match request.call_queue.upgrade() {
                Some(call_queue) => matched.push((request.completion, call_queue, incoming)),
                None => {
                    deferred.push(Deferred::Fail(request.completion));
                    matcher.backlog.push_front(incoming);
                }
            }
        }

        for (completion, call_queue, incoming) in matched {
            let stream = incoming.stream;
            if stream.begin_tracking() {
                state.active.insert(stream.id(), Arc::downgrade(&stream));
            }
            let request = RequestedCall {
                metadata: stream.request_metadata(),
                details: CallDetails::of(&stream),
                payload: incoming.payload,
                call: None,
            };
            debug!(
                server = self.id,
                stream = stream.id(),
                method = stream.method(),
                "call delivered"
            );
            let call = Call::new(
                stream,
                Side::Server,
                &call_queue,
                self.args.max_send_message_length(),
            );
            deferred.push(Deferred::Deliver(
                completion,
                RequestedCall {
                    call: Some(call),
                    ..request
                },
            ));
        }
    }

    /// Move to `ShuttingDown`: stop accepting and fail everything unclaimed.
    fn begin_shutdown(&self, state: &mut ServerState, deferred: &mut Vec<Deferred>) {
        if matches!(state.phase, Phase::ShuttingDown | Phase::Shutdown) {
            return;
        }
        info!(server = self.id, active = state.active.len(), "server shutting down");
        state.phase = Phase::ShuttingDown;

        let acceptor = self.acceptor();
        for port in &mut state.ports {
            transport::unregister(&port.bound, &acceptor);
            port.listener = None;
        }

        let unavailable = || Status::local(StatusCode::Unavailable, "Server shutting down");
        let matchers = std::iter::once(&mut state.general)
            .chain(state.methods.iter_mut().map(|m| &mut m.matcher));
        for matcher in matchers {
            for request in matcher.requested.drain(..) {
                deferred.push(Deferred::Fail(request.completion));
            }
            for incoming in matcher.backlog.drain(..) {
                deferred.push(Deferred::Cancel(incoming.stream, unavailable()));
            }
        }
        for (_, (stream, _)) in state.awaiting_payload.drain() {
            deferred.push(Deferred::Cancel(stream, unavailable()));
        }

        state.active.retain(|_, stream| stream.strong_count() > 0);
    }

    /// Deliver shutdown tags once no accepted call remains.
    fn maybe_finish(&self, state: &mut ServerState, deferred: &mut Vec<Deferred>) {
        if state.phase != Phase::ShuttingDown || !state.active.is_empty() {
            return;
        }
        state.phase = Phase::Shutdown;
        debug!(server = self.id, "server shutdown complete");
        for completion in state.shutdown_waiters.drain(..) {
            deferred.push(Deferred::Finish(completion));
        }
    }

    fn cancel_all(&self) {
        let streams: Vec<_> = self
            .state
            .lock()
            .active
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for stream in streams {
            stream.cancel(Status::local(StatusCode::Cancelled, "Cancelled all calls"));
        }
    }
}

impl Acceptor for ServerInner {
    fn accept(&self, stream: Arc<Stream>) {
        let mut deferred = Vec::new();
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Running {
                deferred.push(Deferred::Cancel(
                    stream,
                    Status::local(StatusCode::Unavailable, "Server not accepting calls"),
                ));
            } else {
                stream.attach(self.tracker(), self.args.max_receive_message_length());
                let method = state.methods.iter().position(|m| m.matches(&stream));
                let wants_payload = method
                    .and_then(|i| state.methods.get(i))
                    .is_some_and(|m| m.payload == PayloadHandling::ReadInitialByteBuffer);

                if wants_payload {
                    let (payload, effects) = stream.take_initial_payload();
                    deferred.push(Deferred::Run(stream.clone(), effects));
                    match payload {
                        InitialPayload::Ready(payload) => {
                            self.enqueue(&mut state, method, Incoming { stream, payload }, &mut deferred)
                        }
                        InitialPayload::Pending => {
                            if let Some(index) = method {
                                state.awaiting_payload.insert(stream.id(), (stream, index));
                            }
                        }
                    }
                } else {
                    let incoming = Incoming {
                        stream,
                        payload: None,
                    };
                    self.enqueue(&mut state, method, incoming, &mut deferred);
                }
            }
        }
        run_all(deferred);
    }
}

impl CallTracker for ServerInner {
    fn call_finished(&self, stream_id: u64) {
        let mut deferred = Vec::new();
        {
            let mut state = self.state.lock();
            state.active.remove(&stream_id);
            self.maybe_finish(&mut state, &mut deferred);
        }
        run_all(deferred);
    }

    fn payload_ready(&self, stream: &Arc<Stream>) {
        let mut deferred = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some((stream, index)) = state.awaiting_payload.remove(&stream.id()) {
                let (payload, effects) = stream.take_initial_payload();
                deferred.push(Deferred::Run(stream.clone(), effects));
                match payload {
                    InitialPayload::Ready(payload) => {
                        self.enqueue(&mut state, Some(index), Incoming { stream, payload }, &mut deferred)
                    }
                    InitialPayload::Pending => {
                        state.awaiting_payload.insert(stream.id(), (stream, index));
                    }
                }
            }
        }
        run_all(deferred);
    }
}

/// Server-side listener and factory for inbound calls.
///
/// Dropping a server shuts it down if that has not happened yet and cancels
/// every call it accepted that is still running.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server configured by `args`.
    pub fn new(args: ChannelArgs) -> Self {
        let inner = Arc::new_cyclic(|me| ServerInner {
            id: NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            args,
            state: Mutex::new(ServerState {
                phase: Phase::Created,
                queues: Vec::new(),
                ports: Vec::new(),
                general: Matcher::default(),
                methods: Vec::new(),
                awaiting_payload: HashMap::new(),
                active: HashMap::new(),
                shutdown_waiters: Vec::new(),
            }),
        });
        Self { inner }
    }

    /// Register a completion queue for call notifications and shutdown.
    ///
    /// Must be called before [`start`](Self::start).
    pub fn register_completion_queue(&self, queue: &CompletionQueue) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Created {
            return Err(Error::AlreadyStarted);
        }
        if !state.is_registered(queue) {
            state.queues.push(Arc::downgrade(queue.inner()));
        }
        Ok(())
    }

    /// Register a method so its calls are delivered through
    /// [`request_registered_call`](Self::request_registered_call).
    ///
    /// `host` of `None` matches any host.
    pub fn register_method(
        &self,
        method: &str,
        host: Option<&str>,
        payload: PayloadHandling,
    ) -> Result<RegisteredMethod, Error> {
        let mut state = self.inner.state.lock();
        if state.phase != Phase::Created {
            return Err(Error::AlreadyStarted);
        }
        if state
            .methods
            .iter()
            .any(|m| m.method == method && m.host.as_deref() == host)
        {
            return Err(Error::MethodAlreadyRegistered {
                method: method.to_string(),
                host: host.unwrap_or("*").to_string(),
            });
        }
        state.methods.push(Method {
            method: method.to_string(),
            host: host.map(str::to_string),
            payload,
            matcher: Matcher::default(),
        });
        Ok(RegisteredMethod {
            server: self.inner.id,
            index: state.methods.len() - 1,
        })
    }

    /// Bind `address` and return the bound port.
    ///
    /// Binding the same address string twice returns the port bound the
    /// first time. Port `0` binds an ephemeral port.
    pub fn add_port(&self, address: &str) -> Result<u16, Error> {
        let mut state = self.inner.state.lock();
        if let Some(bound) = state.ports.iter().find(|p| p.address == address) {
            return Ok(bound.bound.port());
        }
        if state.phase != Phase::Created {
            return Err(Error::AlreadyStarted);
        }

        let parsed = address.parse::<Address>()?;
        let listener = transport::bind(&parsed)?;
        let port = listener.local_addr()?.port();
        debug!(server = self.inner.id, address, port, "port bound");
        state.ports.push(BoundPort {
            address: address.to_string(),
            bound: parsed.with_port(port),
            listener: Some(listener),
        });
        Ok(port)
    }

    /// Start accepting calls. Must be called exactly once.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        match state.phase {
            Phase::Created => {}
            Phase::Running => return Err(Error::AlreadyStarted),
            Phase::ShuttingDown | Phase::Shutdown => return Err(Error::ShuttingDown),
        }
        if state.queues.is_empty() {
            warn!(server = self.inner.id, "server started without completion queues");
        }
        state.phase = Phase::Running;
        for port in &state.ports {
            transport::register(&port.bound, self.inner.acceptor());
        }
        info!(
            server = self.inner.id,
            ports = ?state.ports.iter().map(|p| p.bound.port()).collect::<Vec<_>>(),
            "server started"
        );
        Ok(())
    }

    /// Arm a one-shot request for the next incoming call.
    ///
    /// The call is delivered as an event with `tag` on `notify_queue`; the
    /// new [`Call`] is bound to `call_queue`. After shutdown the request
    /// completes immediately with `success = false`.
    pub fn request_call(
        &self,
        call_queue: &CompletionQueue,
        notify_queue: &CompletionQueue,
        tag: Tag,
    ) -> Result<(), CallError> {
        self.arm(None, call_queue, notify_queue, tag)
    }

    /// Arm a one-shot request for the next call to a registered method.
    ///
    /// `want_payload` must agree with the method's [`PayloadHandling`];
    /// otherwise, or when `method` belongs to another server, this fails
    /// with [`CallError::PayloadTypeMismatch`].
    pub fn request_registered_call(
        &self,
        method: RegisteredMethod,
        call_queue: &CompletionQueue,
        notify_queue: &CompletionQueue,
        tag: Tag,
        want_payload: bool,
    ) -> Result<(), CallError> {
        if method.server != self.inner.id {
            return Err(CallError::PayloadTypeMismatch);
        }
        {
            let state = self.inner.state.lock();
            let Some(registered) = state.methods.get(method.index) else {
                return Err(CallError::PayloadTypeMismatch);
            };
            let reads = registered.payload == PayloadHandling::ReadInitialByteBuffer;
            if reads != want_payload {
                return Err(CallError::PayloadTypeMismatch);
            }
        }
        self.arm(Some(method.index), call_queue, notify_queue, tag)
    }

    fn arm(
        &self,
        method: Option<usize>,
        call_queue: &CompletionQueue,
        notify_queue: &CompletionQueue,
        tag: Tag,
    ) -> Result<(), CallError> {
        let mut deferred = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if !state.is_registered(notify_queue) {
                return Err(CallError::NotServerCompletionQueue);
            }
            let completion = notify_queue.inner().begin(&tag)?;
            if matches!(state.phase, Phase::ShuttingDown | Phase::Shutdown) {
                deferred.push(Deferred::Fail(completion));
            } else {
                state.matcher(method).requested.push_back(PendingRequest {
                    completion,
                    call_queue: Arc::downgrade(call_queue.inner()),
                });
                self.inner.pump(&mut state, method, &mut deferred);
            }
        }
        run_all(deferred);
        Ok(())
    }

    /// Shut the server down, delivering `tag` on `queue` when done.
    ///
    /// Stops accepting calls and releases the bound ports. Armed requests
    /// complete with `success = false` and calls that arrived but were never
    /// requested are cancelled with `UNAVAILABLE`. The shutdown event is
    /// delivered once every accepted call has finished. Each call to
    /// `shutdown` gets its own event.
    pub fn shutdown(&self, queue: &CompletionQueue, tag: Tag) -> Result<(), CallError> {
        let mut deferred = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if !state.is_registered(queue) {
                return Err(CallError::NotServerCompletionQueue);
            }
            let completion = queue.inner().begin(&tag)?;
            self.inner.begin_shutdown(&mut state, &mut deferred);
            if state.phase == Phase::Shutdown {
                deferred.push(Deferred::Finish(completion));
            } else {
                state.shutdown_waiters.push(completion);
                self.inner.maybe_finish(&mut state, &mut deferred);
            }
        }
        run_all(deferred);
        Ok(())
    }

    /// Cancel every accepted call that has not finished.
    pub fn cancel_all_calls(&self) {
        self.inner.cancel_all();
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ChannelArgs::empty())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Server")
            .field("id", &self.inner.id)
            .field("phase", &state.phase)
            .field("ports", &state.ports.iter().map(|p| p.bound.port()).collect::<Vec<_>>())
            .field(
                "listening",
                &state.ports.iter().filter(|p| p.listener.is_some()).count(),
            )
            .field("active", &state.active.len())
            .finish()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let mut deferred = Vec::new();
        {
            let mut state = self.inner.state.lock();
            self.inner.begin_shutdown(&mut state, &mut deferred);
            self.inner.maybe_finish(&mut state, &mut deferred);
        }
        run_all(deferred);
        self.inner.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Channel, CompletionType, Metadata, Operation, Timespec};
    use std::time::Duration;

    fn soon() -> Timespec {
        Timespec::after(Duration::from_millis(200))
    }

    #[test]
    fn test_server_up_down() {
        let server = Server::new(ChannelArgs::empty());
        drop(server);
    }

    #[test]
    fn test_start_no_explicit_shutdown() {
        let server = Server::default();
        let cq = CompletionQueue::new();
        let client_cq = CompletionQueue::new();
        server.register_completion_queue(&cq).unwrap();
        let port = server.add_port("[::]:0").unwrap();
        assert_ne!(port, 0);
        server.start().unwrap();

        let accepted = Tag::new();
        server.request_call(&cq, &cq, accepted.clone()).unwrap();
        let channel = Channel::new(&format!("localhost:{}", port), ChannelArgs::empty()).unwrap();
        let client = channel.create_call(&client_cq, "m", "h", Timespec::inf_future());
        let status = Tag::new();
        client
            .start_batch(
                [
                    Operation::send_initial_metadata(Metadata::new()),
                    Operation::receive_status_on_client(),
                ],
                status.clone(),
            )
            .unwrap();
        let mut event = cq.pluck(&accepted, soon());
        assert!(event.success());
        let _server_call = event.take_call().unwrap();

        let armed = Tag::new();
        server.request_call(&cq, &cq, armed.clone()).unwrap();
        drop(server);

        let event = cq.pluck(&armed, soon());
        assert_eq!(event.completion_type(), CompletionType::OperationComplete);
        assert!(!event.success());

        let event = client_cq.pluck(&status, soon());
        let result = &event.batch_operations()[0];
        assert_eq!(result.received_status_code(), Some(StatusCode::Cancelled));
        assert_eq!(result.received_status_details(), Some("Cancelled all calls"));
    }

    #[test]
    fn test_start_shutdown() {
        let cq = CompletionQueue::new();
        let server = Server::default();
        server.add_port("[::]:0").unwrap();
        server.register_completion_queue(&cq).unwrap();
        server.start().unwrap();

        let tag = Tag::new();
        server.shutdown(&cq, tag.clone()).unwrap();
        let event = cq.poll(soon());
        assert_eq!(event.completion_type(), CompletionType::OperationComplete);
        assert_eq!(event.tag(), Some(&tag));
        assert!(event.success());
    }

    #[test]
    fn test_add_port_idempotent() {
        let server = Server::default();
        let first = server.add_port("127.0.0.1:0").unwrap();
        let again = server.add_port("127.0.0.1:0").unwrap();
        assert_eq!(first, again);
        assert!(server.add_port("not an address").is_err());
    }

    #[test]
    fn test_lifecycle_errors() {
        let server = Server::default();
        let cq = CompletionQueue::new();
        server.register_completion_queue(&cq).unwrap();
        server.start().unwrap();
        assert!(matches!(server.start(), Err(Error::AlreadyStarted)));
        assert!(matches!(
            server.register_completion_queue(&cq),
            Err(Error::AlreadyStarted)
        ));
        assert!(matches!(
            server.add_port("127.0.0.1:0"),
            Err(Error::AlreadyStarted)
        ));
        assert!(matches!(
            server.register_method("m", None, PayloadHandling::None),
            Err(Error::AlreadyStarted)
        ));

        server.shutdown(&cq, Tag::new()).unwrap();
        assert!(matches!(server.start(), Err(Error::ShuttingDown)));
    }

    #[test]
    fn test_unregistered_queue() {
        let server = Server::default();
        let cq = CompletionQueue::new();
        let other = CompletionQueue::new();
        server.register_completion_queue(&cq).unwrap();
        server.start().unwrap();
        assert_eq!(
            server.request_call(&cq, &other, Tag::new()).unwrap_err(),
            CallError::NotServerCompletionQueue
        );
        assert_eq!(
            server.shutdown(&other, Tag::new()).unwrap_err(),
            CallError::NotServerCompletionQueue
        );
    }

    #[test]
    fn test_shutdown_fails_armed_requests() {
        let server = Server::default();
        let cq = CompletionQueue::new();
        server.register_completion_queue(&cq).unwrap();
        server.start().unwrap();

        let request = Tag::new();
        server.request_call(&cq, &cq, request.clone()).unwrap();
        let shutdown = Tag::new();
        server.shutdown(&cq, shutdown.clone()).unwrap();

        let first = cq.poll(soon());
        assert_eq!(first.tag(), Some(&request));
        assert!(!first.success());
        let second = cq.poll(soon());
        assert_eq!(second.tag(), Some(&shutdown));
        assert!(second.success());

        let late = Tag::new();
        server.request_call(&cq, &cq, late.clone()).unwrap();
        let event = cq.poll(soon());
        assert_eq!(event.tag(), Some(&late));
        assert!(!event.success());
    }

    #[test]
    fn test_every_shutdown_gets_its_tag() {
        let server = Server::default();
        let cq = CompletionQueue::new();
        server.register_completion_queue(&cq).unwrap();
        server.start().unwrap();

        let tags = [Tag::new(), Tag::new()];
        for tag in &tags {
            server.shutdown(&cq, tag.clone()).unwrap();
        }
        for tag in &tags {
            let event = cq.pluck(tag, soon());
            assert_eq!(event.tag(), Some(tag));
            assert!(event.success());
        }
    }

    #[test]
    fn test_register_method() {
        let server = Server::default();
        let cq = CompletionQueue::new();
        server.register_completion_queue(&cq).unwrap();
        let method = server
            .register_method("/svc/Unary", None, PayloadHandling::ReadInitialByteBuffer)
            .unwrap();
        assert!(matches!(
            server.register_method("/svc/Unary", None, PayloadHandling::None),
            Err(Error::MethodAlreadyRegistered { .. })
        ));
        server
            .register_method("/svc/Unary", Some("hostess"), PayloadHandling::None)
            .unwrap();
        server.start().unwrap();

        assert_eq!(
            server
                .request_registered_call(method, &cq, &cq, Tag::new(), false)
                .unwrap_err(),
            CallError::PayloadTypeMismatch
        );
        server
            .request_registered_call(method, &cq, &cq, Tag::new(), true)
            .unwrap();

        let other = Server::default();
        assert_eq!(
            other
                .request_registered_call(method, &cq, &cq, Tag::new(), true)
                .unwrap_err(),
            CallError::PayloadTypeMismatch
        );
    }
}
