//! End-to-end tests: invokers and performers connected over in-memory
//! duplex streams (and one real TCP listener).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use remop_core::imisc::{self, Data, Empty, Ia5List, ImiscError, Ping, UtcResult};
use remop_core::{
    ErrorDescriptor, FixedClock, InvokeId, InvokeProblem, OperationCode, OperationTable,
    RejectProblem, RemoteError, RemoteOperation,
};
use remop_runtime::service::{Invocation, OperationError, OperationResponse};
use remop_runtime::{
    ClientConfig, CompletionHandlers, ErrorKind, ImiscClient, ImiscConfig, ImiscService,
    InvocationOptions, InvokeError, NetworkConfig, OperationRouter, Performer, RosClient,
    RosServer, ServerConfig, SessionConfig,
};

fn imisc_table() -> Arc<OperationTable> {
    Arc::new(imisc::table().clone())
}

fn start(router: OperationRouter) -> Performer {
    let performer = Performer::new(router, ServerConfig::default(), SessionConfig::default());
    performer.shutdown_controller().set_ready();
    performer
}

fn imisc_performer() -> Performer {
    let at = Utc.with_ymd_and_hms(2001, 2, 3, 4, 5, 6).unwrap();
    let service = Arc::new(ImiscService::new(ImiscConfig {
        users: vec!["alice".into(), "bob".into()],
        quotes: vec!["Time flies like an arrow.".into()],
        clock: Arc::new(FixedClock(at)),
        ..ImiscConfig::default()
    }));
    start(service.router(imisc_table()).unwrap())
}

fn ros_client(performer: &Performer, table: Arc<OperationTable>, config: ClientConfig) -> RosClient {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    performer.attach(remote, None);
    RosClient::connect(local, table, config)
}

fn imisc_client(performer: &Performer) -> ImiscClient {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    performer.attach(remote, None);
    ImiscClient::connect(local, ClientConfig::default())
}

/// A router whose ping handler sleeps for `delay`.
fn slow_ping(delay: Duration) -> OperationRouter {
    let mut router = OperationRouter::new(imisc_table());
    router
        .handle::<Ping, _, _, RemoteError>(move |_ctx, _: Empty| async move {
            tokio::time::sleep(delay).await;
            Ok(Empty)
        })
        .unwrap();
    router
}

/// An operation the IMISC performer does not know.
struct Unlisted;

impl RemoteOperation for Unlisted {
    const CODE: OperationCode = OperationCode(42);
    const NAME: &'static str = "unlisted";
    type Argument = Empty;
    type Result = Empty;
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn every_registered_operation_reaches_its_handler_exactly_once() {
    let table = imisc_table();
    let calls: Arc<HashMap<OperationCode, AtomicUsize>> = Arc::new(
        table
            .operations()
            .map(|d| (d.code, AtomicUsize::new(0)))
            .collect(),
    );

    let mut router = OperationRouter::new(Arc::clone(&table));
    for descriptor in table.operations() {
        let calls = Arc::clone(&calls);
        router
            .register(
                descriptor.code,
                tower::service_fn(move |inv: Invocation| {
                    calls[&inv.ctx.operation].fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, OperationError>(OperationResponse::Result(vec![0xC0])) }
                }),
            )
            .unwrap();
    }
    let performer = start(router);
    let client = ros_client(&performer, Arc::clone(&table), ClientConfig::default());

    for descriptor in table.operations() {
        let result = client
            .invoke_raw(descriptor.code, vec![0xC0], InvocationOptions::default())
            .await
            .unwrap();
        assert_eq!(result, vec![0xC0], "{}", descriptor.name);
    }

    for (code, count) in calls.iter() {
        assert_eq!(count.load(Ordering::SeqCst), 1, "operation {code}");
    }
    client.close().await;
}

#[tokio::test]
async fn unknown_operation_fails_before_sending() {
    let performer = imisc_performer();
    let client = ros_client(&performer, imisc_table(), ClientConfig::default());

    let err = client.invoke::<Unlisted>(&Empty).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!err.is_recoverable());
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn performer_rejects_operation_it_does_not_know() {
    let performer = imisc_performer();
    let wider = OperationTable::builder(imisc::MODULE)
        .operation::<Ping>()
        .operation::<Unlisted>()
        .error(ErrorDescriptor::new(imisc::errors::CONGESTED, "congested"))
        .build()
        .unwrap();
    let client = ros_client(&performer, Arc::new(wider), ClientConfig::default());

    let err = client.invoke::<Unlisted>(&Empty).await.unwrap_err();
    assert!(matches!(
        err,
        InvokeError::Rejected(RejectProblem::Invoke(InvokeProblem::UnrecognisedOperation))
    ));
    assert_eq!(err.kind(), ErrorKind::Remote);

    // The session is still usable.
    client.invoke::<Ping>(&Empty).await.unwrap();
}

#[tokio::test]
async fn concurrent_invocations_do_not_cross() {
    let performer = imisc_performer();
    let client = Arc::new(imisc_client(&performer));

    let calls = (0..64).map(|i| {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let sent = Data(rmpv::Value::from(i));
            let got = client.echo(&sent).await.unwrap();
            assert_eq!(got, sent);
        })
    });
    for call in calls.collect::<Vec<_>>() {
        call.await.unwrap();
    }

    let mut receivers = Vec::new();
    for i in 0..16 {
        let (handlers, rx) = CompletionHandlers::channel();
        client
            .echo_with(&Data(rmpv::Value::from(format!("cb-{i}"))), handlers)
            .await
            .unwrap();
        receivers.push((i, rx));
    }
    for (i, rx) in receivers {
        let got: Data = rx.await.unwrap().unwrap();
        assert_eq!(got, Data(rmpv::Value::from(format!("cb-{i}"))));
    }
    assert_eq!(client.ros().outstanding(), 0);
}

// ---------------------------------------------------------------------------
// IMISC
// ---------------------------------------------------------------------------

#[tokio::test]
async fn imisc_operations_round_trip() {
    let performer = imisc_performer();
    let client = imisc_client(&performer);

    assert_eq!(client.utc_time().await.unwrap(), UtcResult("010203040506Z".into()));
    assert_eq!(
        client.users().await.unwrap(),
        Ia5List::lossy(["alice", "bob"])
    );
    assert_eq!(
        client.qotd().await.unwrap(),
        Ia5List::lossy(["Time flies like an arrow."])
    );
    assert_eq!(client.char_gen().await.unwrap().len(), 10);
    assert_eq!(client.pwd_gen().await.unwrap().len(), 6);
    client.ping().await.unwrap();
    client.sink(&Data(rmpv::Value::from("gone"))).await.unwrap();
    client
        .tell_user(&Ia5List::lossy(["bob", "lunch?"]))
        .await
        .unwrap();

    let finger = client.finger(&Ia5List::lossy(["bob"])).await.unwrap();
    assert_eq!(finger.as_slice(), ["Login: bob\tMessages: 1".to_string()]);

    client.close().await;
}

#[tokio::test]
async fn imisc_errors_arrive_as_remote_errors() {
    let performer = imisc_performer();
    let client = imisc_client(&performer);

    let err = client
        .finger(&Ia5List::lossy(["mallory"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Remote);
    assert_eq!(
        err.imisc(),
        Some(ImiscError::UserNotLoggedIn(Ia5List::lossy(["mallory"])))
    );

    let (handlers, rx) = CompletionHandlers::channel();
    client
        .tell_user_with(&Ia5List::lossy(["mallory", "hi"]), handlers)
        .await
        .unwrap();
    let err: InvokeError = rx.await.unwrap().unwrap_err();
    assert!(matches!(err.imisc(), Some(ImiscError::UserNotLoggedIn(_))));
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn blocking_and_callback_invocations_time_out() {
    let performer = start(slow_ping(Duration::from_millis(500)));
    let config = ClientConfig {
        sweep_interval: Duration::from_millis(10),
        ..ClientConfig::default()
    };
    let client = ros_client(&performer, imisc_table(), config);
    let short = InvocationOptions::default().with_timeout(Duration::from_millis(50));

    let err = client.invoke_opts::<Ping>(&Empty, short.clone()).await.unwrap_err();
    assert!(matches!(err, InvokeError::Timeout { .. }));
    assert_eq!(err.kind(), ErrorKind::Transport);

    let (handlers, rx) = CompletionHandlers::<Empty>::channel();
    let id = client
        .invoke_with_opts::<Ping>(&Empty, short, handlers)
        .await
        .unwrap();
    let err = rx.await.unwrap().unwrap_err();
    assert!(matches!(err, InvokeError::Timeout { invoke_id, .. } if invoke_id == id));
}

#[tokio::test]
async fn performer_shutdown_fails_outstanding_invocations() {
    let performer = start(slow_ping(Duration::from_secs(5)));
    let client = Arc::new(ros_client(&performer, imisc_table(), ClientConfig::default()));

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.invoke::<Ping>(&Empty).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!performer.drain(Duration::from_millis(10)).await);
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, InvokeError::SessionClosed));
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn duplicate_caller_supplied_id_is_refused() {
    let performer = start(slow_ping(Duration::from_millis(200)));
    let client = Arc::new(ros_client(&performer, imisc_table(), ClientConfig::default()));
    let fixed = InvocationOptions::default().with_invoke_id(InvokeId(7));

    let first = {
        let client = Arc::clone(&client);
        let fixed = fixed.clone();
        tokio::spawn(async move { client.invoke_opts::<Ping>(&Empty, fixed).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = client.invoke_opts::<Ping>(&Empty, fixed).await.unwrap_err();
    assert!(matches!(err, InvokeError::DuplicateInvokeId(InvokeId(7))));
    assert_eq!(err.kind(), ErrorKind::Configuration);

    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn overloaded_performer_rejects_with_resource_limitation() {
    let config = ServerConfig {
        max_concurrent_operations: 1,
        ..ServerConfig::default()
    };
    let performer = Performer::new(slow_ping(Duration::from_millis(200)), config, SessionConfig::default());
    performer.shutdown_controller().set_ready();
    let client = Arc::new(ros_client(&performer, imisc_table(), ClientConfig::default()));

    let first = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.invoke::<Ping>(&Empty).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = client.invoke::<Ping>(&Empty).await.unwrap_err();
    assert!(matches!(
        err,
        InvokeError::Rejected(RejectProblem::Invoke(InvokeProblem::ResourceLimitation))
    ));
    first.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tcp_server_serves_imisc_until_shutdown() {
    let service = Arc::new(ImiscService::new(ImiscConfig {
        users: vec!["alice".into()],
        ..ImiscConfig::default()
    }));
    let network = NetworkConfig {
        host: "127.0.0.1".into(),
        drain_timeout: Duration::from_secs(1),
        ..NetworkConfig::default()
    };
    let mut server = RosServer::new(network, ServerConfig::default(), service.router(imisc_table()).unwrap());
    let port = server.start().await.unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(server.serve(async {
        let _ = stop_rx.await;
    }));

    let client = ImiscClient::connect_tcp(("127.0.0.1", port), ClientConfig::default())
        .await
        .unwrap();
    assert_eq!(client.users().await.unwrap(), Ia5List::lossy(["alice"]));
    let echoed = client.echo(&Data(rmpv::Value::from(vec![1u8, 2, 3]))).await.unwrap();
    assert_eq!(echoed, Data(rmpv::Value::from(vec![1u8, 2, 3])));

    stop_tx.send(()).unwrap();
    serving.await.unwrap().unwrap();

    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, InvokeError::SessionClosed));
}
