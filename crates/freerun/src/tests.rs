//! Unit tests for the registry, the binder, invoke futures and an in-memory fabric.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use freerpc::Address;
use freerpc::Invocation;
use freerpc::Request;
use freerpc::Value;

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::config::WorkerConfig;
use crate::dispatch::DispatchError;
use crate::dispatch::Param;
use crate::dispatch::Service;
use crate::dispatch::bind_arguments;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::error::Result;
use crate::future::InvokeFuture;
use crate::manager::Direction;
use crate::manager::Manager;
use crate::manager::ManagerExtension;
use crate::manager::RegistryError;
use crate::mock_transport::DuplexTransport;
use crate::runtime::Runtime;
use crate::runtime::RuntimeError;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::worker::Arguments;
use crate::worker::Target;
use crate::worker::Worker;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn addr(n: u8) -> Address {
    Address::new(vec![0, 0, 0, 0, n])
}

fn request(function: &str, args: Vec<Value>, kwargs: Vec<(&str, Value)>) -> Request {
    Request {
        function: function.into(),
        arguments: args,
        keyword_arguments: kwargs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect(),
    }
}

fn broker_config(livetime: f64) -> BrokerConfig {
    BrokerConfig { heartbeat_livetime: livetime, ..BrokerConfig::default() }
}

// ============================================================================
// Argument Binding
// ============================================================================

#[test]
fn binds_positional_then_keyword_then_default() -> std::result::Result<(), DispatchError> {
    let params = [Param::required("a"), Param::required("b"), Param::optional("c", 3)];
    let bound = bind_arguments("f", &params, vec![1.into()], vec![("b".into(), 2.into())])?;
    assert_eq!(bound, vec![Value::from(1), Value::from(2), Value::from(3)]);
    Ok(())
}

#[test]
fn rejects_extra_positional_arguments() {
    let params = [Param::required("a")];
    let err = bind_arguments("f", &params, vec![1.into(), 2.into()], vec![]).unwrap_err();
    assert_eq!(err.to_string(), "Function [f] expects [1] arguments, but [2] were given.");
}

#[test]
fn rejects_unknown_keyword() {
    let params = [Param::required("a")];
    let err = bind_arguments("f", &params, vec![], vec![("z".into(), 1.into())]).unwrap_err();
    assert_eq!(err.to_string(), "Keyword Argument [z] not available for function [f].");
}

#[test]
fn rejects_duplicate_and_missing_arguments() {
    let params = [Param::required("a"), Param::required("b")];
    let dup = bind_arguments("f", &params, vec![1.into()], vec![("a".into(), 1.into())]).unwrap_err();
    assert!(matches!(dup, DispatchError::DuplicateArgument { .. }));
    let missing = bind_arguments("f", &params, vec![1.into()], vec![]).unwrap_err();
    assert_eq!(
        missing,
        DispatchError::MissingArgument { function: "f".into(), name: "b".into() }
    );
}

#[tokio::test]
async fn service_performs_and_reports_missing_functions() {
    let service = Service::builder()
        .method("add", [Param::required("a"), Param::optional("b", 10)], |call| {
            Ok(Value::from(call.i64(0)? + call.i64(1)?))
        })
        .constant("version", "1.0")
        .build();

    let sum = service.perform(addr(1), request("add", vec![5.into()], vec![])).await;
    assert_eq!(sum, Ok(Value::from(15)));

    let missing = service.perform(addr(1), request("sub", vec![], vec![])).await;
    assert_eq!(missing.unwrap_err().to_string(), "Function [sub] not available.");

    // Constants are attributes, not methods.
    let constant = service.perform(addr(1), request("version", vec![], vec![])).await;
    assert_eq!(constant.unwrap_err().to_string(), "Function [version] not available.");
    assert_eq!(service.constant("version"), Some(&Value::from("1.0")));
    assert_eq!(service.method_names(), vec!["add".to_string()]);

    let bad = service.perform(addr(1), request("add", vec!["x".into()], vec![])).await;
    assert!(matches!(bad, Err(DispatchError::Failed(_))));
}

// ============================================================================
// Registry
// ============================================================================

#[test]
fn register_and_lookup() -> std::result::Result<(), RegistryError> {
    let now = Instant::now();
    let mut manager = Manager::new(&BrokerConfig::default(), now);
    manager.register_as_service(&addr(1), "Echo", vec![], false, now)?;

    assert_eq!(manager.address_of_service("Echo"), Some(&addr(1)));
    assert_eq!(manager.service_of(&addr(1)), Some("Echo"));
    assert_eq!(manager.service_names(), vec!["Echo".to_string()]);

    // Registering the same name again is an idempotent refresh.
    manager.register_as_service(&addr(1), "Echo", vec![], false, now)?;
    Ok(())
}

#[test]
fn occupied_name_requires_force() -> std::result::Result<(), RegistryError> {
    let now = Instant::now();
    let mut manager = Manager::new(&BrokerConfig::default(), now);
    manager.register_as_service(&addr(1), "Echo", vec![], false, now)?;

    let err = manager.register_as_service(&addr(2), "Echo", vec![], false, now).unwrap_err();
    assert_eq!(err.to_string(), "Service name [Echo] occupied.");

    manager.register_as_service(&addr(2), "Echo", vec![], true, now)?;
    assert_eq!(manager.address_of_service("Echo"), Some(&addr(2)));
    assert_eq!(manager.service_of(&addr(1)), None);

    // The displaced owner's unregister must not drop the new owner.
    assert_eq!(manager.unregister(&addr(1)), None);
    assert_eq!(manager.address_of_service("Echo"), Some(&addr(2)));
    Ok(())
}

#[test]
fn one_name_per_worker() -> std::result::Result<(), RegistryError> {
    let now = Instant::now();
    let mut manager = Manager::new(&BrokerConfig::default(), now);
    manager.register_as_service(&addr(1), "X", vec![], false, now)?;
    let err = manager.register_as_service(&addr(1), "Y", vec![], true, now).unwrap_err();
    assert_eq!(err, RegistryError::AlreadyRegistered("X".into()));
    assert_eq!(manager.address_of_service("Y"), None);
    Ok(())
}

#[test]
fn unregister_frees_the_name() -> std::result::Result<(), RegistryError> {
    let now = Instant::now();
    let mut manager = Manager::new(&BrokerConfig::default(), now);
    manager.register_as_service(&addr(1), "Echo", vec![], false, now)?;
    assert_eq!(manager.unregister(&addr(1)), Some("Echo".into()));
    assert_eq!(manager.unregister(&addr(1)), None);
    manager.register_as_service(&addr(2), "Echo", vec![], false, now)?;
    Ok(())
}

#[test]
fn sweep_evicts_silent_peers() -> std::result::Result<(), RegistryError> {
    let start = Instant::now();
    let mut manager = Manager::new(&broker_config(10.0), start);
    manager.register_as_service(&addr(1), "Quiet", vec![], false, start)?;
    manager.register_as_service(&addr(2), "Lively", vec![], false, start)?;
    assert!(manager.heartbeat(&addr(1), start));
    assert!(manager.heartbeat(&addr(2), start));
    assert!(!manager.heartbeat(&addr(3), start));

    assert!(manager.sweep(start + Duration::from_secs(5)).is_empty());
    manager.heartbeat(&addr(2), start + Duration::from_secs(8));

    let mut evicted = manager.sweep(start + Duration::from_secs(11));
    evicted.sort();
    assert_eq!(evicted, vec![(addr(1), Some("Quiet".into())), (addr(3), None)]);
    assert_eq!(manager.service_names(), vec!["Lively".to_string()]);
    Ok(())
}

#[test]
fn statistics_follow_the_owner() -> std::result::Result<(), RegistryError> {
    let start = Instant::now();
    let mut manager = Manager::new(&BrokerConfig::default(), start);
    manager.statistics(&addr(1), Direction::Received, 100, start);
    assert_eq!(manager.nonservice_statistics(&addr(1)).map(|s| s.received_bytes), Some(100));

    manager.register_as_service(&addr(1), "Echo", vec![], false, start)?;
    assert_eq!(manager.nonservice_statistics(&addr(1)), None);

    manager.statistics(&addr(1), Direction::Received, 10, start);
    manager.statistics(&addr(1), Direction::Sent, 20, start);
    let stats = manager.service_statistics("Echo").unwrap_or_default();
    assert_eq!(
        (stats.received_messages, stats.received_bytes, stats.sent_messages, stats.sent_bytes),
        (1, 10, 1, 20)
    );
    Ok(())
}

#[test]
fn nonservice_statistics_are_collected() {
    let start = Instant::now();
    let mut manager = Manager::new(&BrokerConfig::default(), start);
    manager.statistics(&addr(1), Direction::Received, 1, start);
    manager.statistics(&addr(2), Direction::Received, 1, start + Duration::from_secs(5));

    // First collection keeps everything seen since the previous one.
    manager.statistics(&addr(2), Direction::Received, 1, start + Duration::from_secs(11));
    assert!(manager.nonservice_statistics(&addr(1)).is_some());

    // Peer 1 was not seen between the two collections.
    manager.statistics(&addr(2), Direction::Received, 1, start + Duration::from_secs(22));
    assert!(manager.nonservice_statistics(&addr(1)).is_none());
    assert_eq!(manager.nonservice_statistics(&addr(2)).map(|s| s.received_messages), Some(3));
}

#[test]
fn registry_rpcs_bind_like_services() {
    let now = Instant::now();
    let mut manager = Manager::new(&BrokerConfig::default(), now);

    let err = manager.perform(&addr(1), request("protocol", vec![1.into(), 2.into(), 3.into()], vec![]), now);
    assert_eq!(err, Err("Function [protocol] expects [0] arguments, but [3] were given.".into()));

    let err = manager.perform(&addr(1), request("protocol", vec![], vec![("a", 1.into())]), now);
    assert_eq!(err, Err("Keyword Argument [a] not available for function [protocol].".into()));

    let err = manager.perform(&addr(1), request("shutdown", vec![], vec![]), now);
    assert_eq!(err, Err("Function [shutdown] not available.".into()));

    assert_eq!(manager.perform(&addr(1), request("protocol", vec![], vec![]), now), Ok("IF1".into()));

    let registered = manager.perform(
        &addr(1),
        request("registerAsService", vec!["Echo".into()], vec![("interfaces", Value::from(vec!["echo"]))]),
        now,
    );
    assert_eq!(registered, Ok(Value::Nil));
    assert_eq!(
        manager.perform(&addr(2), request("getAddressOfService", vec!["Echo".into()], vec![]), now),
        Ok(Value::from(addr(1).as_bytes()))
    );
    assert_eq!(
        manager.perform(&addr(2), request("getAddressOfService", vec!["Nope".into()], vec![]), now),
        Ok(Value::Nil)
    );
    assert_eq!(
        manager.perform(&addr(2), request("listServiceNames", vec![], vec![]), now),
        Ok(Value::from(vec!["Echo"]))
    );
}

#[test]
fn service_meta_lists_services_then_peers() -> std::result::Result<(), RegistryError> {
    let now = Instant::now();
    let mut manager = Manager::new(&BrokerConfig::default(), now);
    manager.register_as_service(&addr(1), "Echo", vec!["echo".into()], false, now)?;
    manager.statistics(&addr(2), Direction::Received, 7, now);

    let meta = manager.service_meta(now + Duration::from_secs(3));
    assert_eq!(meta.len(), 2);
    assert_eq!(meta[0].get("ServiceName"), Some(&Value::from("Echo")));
    assert_eq!(meta[0].get("Interfaces"), Some(&Value::from(vec!["echo"])));
    assert_eq!(meta[0].get("OnTime").and_then(Value::as_f64), Some(3.0));
    assert_eq!(meta[1].get("ServiceName"), Some(&Value::from("")));
    assert_eq!(
        meta[1].get("Statistics").and_then(|s| s.get("Received Bytes")),
        Some(&Value::from(7u64))
    );
    Ok(())
}

fn capitalized_names() -> ManagerExtension {
    ManagerExtension::new().check_registration(|_, name, _| match name.chars().next() {
        Some(first) if first.is_ascii_uppercase() => Ok(()),
        _ => Err("The first letter of the service name should be uppercase.".into()),
    })
}

#[test]
fn registration_check_runs_before_any_change() -> std::result::Result<(), RegistryError> {
    let now = Instant::now();
    let mut manager = Manager::new(&BrokerConfig::default(), now).with_extension(capitalized_names());

    let err = manager.register_as_service(&addr(1), "lower", vec![], false, now).unwrap_err();
    assert_eq!(
        err,
        RegistryError::Rejected("The first letter of the service name should be uppercase.".into())
    );
    assert!(manager.service_names().is_empty());
    assert_eq!(manager.service_of(&addr(1)), None);

    let rejected = manager.perform(&addr(1), request("registerAsService", vec!["".into()], vec![]), now);
    assert_eq!(rejected, Err("The first letter of the service name should be uppercase.".into()));

    manager.register_as_service(&addr(1), "Upper", vec![], false, now)?;
    assert_eq!(manager.service_names(), vec!["Upper".to_string()]);
    Ok(())
}

#[test]
fn extension_never_shadows_registry_rpcs() {
    let now = Instant::now();
    let manager = Manager::new(&BrokerConfig::default(), now);
    assert!(manager.extension_for("echo").is_none());

    let service = Service::builder()
        .method("protocol", [], |_| Ok(Value::from("mine")))
        .method("echo", [], |_| Ok(Value::Nil))
        .build();
    let manager = manager.with_extension(ManagerExtension::new().service(service));
    assert!(manager.extension_for("protocol").is_none());
    assert!(manager.extension_for("heartbeat").is_none());
    assert!(manager.extension_for("echo").is_some());
    // Unknown names go to the extension too, which reports them as unavailable.
    assert!(manager.extension_for("nope").is_some());
}

// ============================================================================
// Invoke Futures
// ============================================================================

#[test]
fn callback_runs_once_on_resolution() {
    let (future, resolver) = InvokeFuture::new("1");
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    future.on_complete(move |f| {
        assert_eq!(f.result(), Some(Value::from(42)));
        seen.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    resolver.resolve(Ok(42.into()), Some("careful".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(future.is_done());
    assert!(future.is_success());
    assert_eq!(future.warning(), Some("careful".into()));
}

#[test]
fn late_callback_runs_immediately() {
    let future = InvokeFuture::ready("2", Err(Error::Remote("boom".into())));
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    future.on_complete(move |f| {
        assert_eq!(f.error(), Some(Error::Remote("boom".into())));
        seen.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!future.is_success());
}

#[test]
fn wait_times_out_and_sync_reports_it() {
    let (future, _resolver) = InvokeFuture::new("3");
    assert!(!future.wait(Some(Duration::from_millis(20))));
    assert_eq!(future.sync(Some(Duration::from_millis(20))), Err(Error::Timeout));
    assert_eq!(Error::Timeout.to_string(), "Time out!");
}

#[test]
fn sync_wakes_on_resolution_from_another_thread() {
    let (future, resolver) = InvokeFuture::new("4");
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        resolver.resolve(Ok("done".into()), None);
    });
    assert_eq!(future.sync(Some(Duration::from_secs(5))), Ok(Value::from("done")));
    handle.join().expect("resolver thread");
}

#[tokio::test]
async fn future_can_be_awaited() -> Result<()> {
    let (future, resolver) = InvokeFuture::new("5");
    let waiter = tokio::spawn(future.clone().into_future());
    tokio::task::yield_now().await;
    resolver.resolve(Ok(7.into()), None);
    let value = waiter.await.map_err(|e| Error::Remote(e.to_string()))??;
    assert_eq!(value, Value::from(7));
    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn endpoints_parse_with_defaults() -> Result<()> {
    let full = Endpoint::parse("tcp://127.0.0.1:2000")?;
    assert_eq!((full.host.as_str(), full.port), ("127.0.0.1", 2000));
    let bare = Endpoint::parse("localhost")?;
    assert_eq!(bare.port, 1061);
    let any = Endpoint::parse("tcp://*:1061")?;
    assert_eq!(any.bind_addr(), "0.0.0.0:1061");
    assert_eq!(any.connect_addr(), "127.0.0.1:1061");
    assert!(Endpoint::parse("udp://h:1").is_err());
    assert!(Endpoint::parse("tcp://h:port").is_err());
    assert!(Endpoint::parse("tcp://:1").is_err());
    Ok(())
}

#[test]
fn configs_deserialize_with_defaults() -> std::result::Result<(), serde_json::Error> {
    let broker: BrokerConfig = serde_json::from_str(r#"{"bind": "tcp://*:2000", "heartbeat_livetime": 4}"#)?;
    assert_eq!(broker.bind, "tcp://*:2000");
    assert_eq!(broker.heartbeat_livetime(), Duration::from_secs(4));
    assert_eq!(broker.sweep_interval(), Duration::from_secs(2));

    let worker: WorkerConfig = serde_json::from_str(r#"{"timeout": 1.5}"#)?;
    assert_eq!(worker.endpoint, "tcp://127.0.0.1:1061");
    assert_eq!(worker.timeout(), Some(Duration::from_millis(1500)));
    assert_eq!(worker.async_timeout(), Duration::from_secs(30));

    let negative = WorkerConfig { heartbeat_livetime: -1.0, ..WorkerConfig::default() };
    assert_eq!(negative.heartbeat_livetime(), Duration::ZERO);
    Ok(())
}

#[test]
fn arguments_collect_positional_and_keyword() -> Result<()> {
    let args = Arguments::new().arg(1).arg("two").kwarg("three", 3.0);
    assert_eq!(args.positional, vec![Value::from(1), Value::from("two")]);
    assert_eq!(args.keyword, vec![("three".to_string(), Value::from(3.0))]);

    let message = Target::Service("Echo".into()).message("echo", ["hi"])?;
    assert_eq!(message.distributing_address(), Some(b"Echo".as_slice()));
    let invocation = message.invocation()?;
    assert_eq!(invocation, Invocation::request("echo", vec!["hi".into()], vec![]));
    Ok(())
}

// ============================================================================
// Runtime
// ============================================================================

#[test]
fn stopped_runtime_stays_stopped() -> Result<()> {
    let runtime = Runtime::new()?;
    assert!(!runtime.is_running());
    assert_eq!(runtime.try_start(), Ok(true));
    assert_eq!(runtime.try_start(), Ok(false));
    assert!(runtime.is_running());

    runtime.stop();
    assert!(!runtime.is_running());
    assert_eq!(runtime.try_start(), Err(RuntimeError::Stopped));
    assert!(!runtime.is_running());
    assert_eq!(runtime.start(), Err(RuntimeError::Stopped));
    assert!(!runtime.is_running());
    Ok(())
}

// ============================================================================
// In-Memory Fabric
// ============================================================================

fn echo_service() -> Service {
    Service::builder()
        .method("echo", [Param::required("text")], |call| {
            Ok(Value::from(format!("ECHO: {}", call.str(0)?)))
        })
        .method("whoami", [], |call| Ok(Value::from(call.source.as_bytes())))
        .build()
}

async fn join(broker: &Broker, runtime: &Runtime, builder: crate::worker::WorkerBuilder) -> Result<Worker> {
    let (near, far) = DuplexTransport::pair();
    broker.attach(Box::new(far));
    builder.attach(Box::new(near), runtime).await
}

#[tokio::test]
async fn calls_route_through_an_in_memory_broker() -> Result<()> {
    init_tracing();
    let runtime = Runtime::from_current()?;
    let broker = Broker::start(BrokerConfig::default(), &runtime);

    let server = join(&broker, &runtime, Worker::builder("mem").service("Echo", echo_service())).await?;
    assert!(server.is_service());
    let client = join(&broker, &runtime, Worker::builder("mem")).await?;

    let echoed = client.service("Echo").call("echo", ["hi"]).await?;
    assert_eq!(echoed, Value::from("ECHO: hi"));

    let missing = client.service("Echo").call("nope", ()).await;
    assert_eq!(missing, Err(Error::Remote("Function [nope] not available.".into())));

    let absent = client.service("Ghost").call("echo", ["hi"]).await;
    assert_eq!(absent, Err(Error::Remote("Service Ghost not exist.".into())));

    assert_eq!(client.broker().call("protocol", ()).await?, Value::from("IF1"));
    assert_eq!(client.broker().call("heartbeat", ()).await?, Value::from(false));
    assert_eq!(server.broker().call("heartbeat", ()).await?, Value::from(true));

    // Direct addressing reaches the same worker, which sees the caller's address.
    let address = client.broker().call("getAddressOfService", ["Echo"]).await?;
    let address = Address::from(address.as_bytes().unwrap_or_default());
    let caller = client.direct(address).call("whoami", ()).await?;
    assert_eq!(caller.as_bytes().map(<[u8]>::len), Some(5));

    server.close().await;
    client.close().await;
    broker.close();
    Ok(())
}

fn who(answer: &'static str) -> Service {
    Service::builder().method("who", [], move |_| Ok(Value::from(answer))).build()
}

#[tokio::test]
async fn second_owner_needs_force() -> Result<()> {
    init_tracing();
    let runtime = Runtime::from_current()?;
    let broker = Broker::start(BrokerConfig::default(), &runtime);
    let client = join(&broker, &runtime, Worker::builder("mem")).await?;

    let first = join(&broker, &runtime, Worker::builder("mem").service("Svc", who("first"))).await?;
    assert_eq!(client.service("Svc").call("who", ()).await?, Value::from("first"));

    let rejected = join(&broker, &runtime, Worker::builder("mem").service("Svc", who("rejected"))).await;
    assert_eq!(rejected.err(), Some(Error::Remote("Service name [Svc] occupied.".into())));
    assert_eq!(client.service("Svc").call("who", ()).await?, Value::from("first"));

    let second = join(&broker, &runtime, Worker::builder("mem").service("Svc", who("second")).force(true)).await?;
    assert_eq!(client.service("Svc").call("who", ()).await?, Value::from("second"));
    assert_eq!(first.broker().call("heartbeat", ()).await?, Value::from(false));
    assert_eq!(second.broker().call("heartbeat", ()).await?, Value::from(true));
    broker.close();
    Ok(())
}

#[tokio::test]
async fn pending_calls_fail_when_the_connection_drops() -> Result<()> {
    let runtime = Runtime::from_current()?;
    let (near, far) = DuplexTransport::pair();
    let worker = Worker::builder("mem").attach(Box::new(near), &runtime).await?;

    let pending = worker.broker().send("time", ())?;
    assert_eq!(worker.pending_calls(), 1);
    drop(far);

    assert_eq!(pending.await, Err(Error::ConnectionLost));
    assert_eq!(worker.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn duplicate_message_ids_are_refused() -> Result<()> {
    let runtime = Runtime::from_current()?;
    let (near, _far) = DuplexTransport::pair();
    let worker = Worker::builder("mem").attach(Box::new(near), &runtime).await?;

    let message = Target::Broker.message("time", ())?;
    let _first = worker.send(message.clone())?;
    let second = worker.send(message.clone());
    assert_eq!(second.err(), Some(Error::DuplicateMessageId(message.message_id().to_owned())));
    Ok(())
}

#[tokio::test]
async fn binding_twice_is_refused() -> Result<()> {
    let runtime = Runtime::from_current()?;
    let (near, _far) = DuplexTransport::pair();
    let worker = Worker::builder("mem").attach(Box::new(near), &runtime).await?;
    worker.bind_service("A", echo_service(), vec![])?;
    assert_eq!(worker.bind_service("B", echo_service(), vec![]), Err(Error::ServiceAlreadyBound));
    assert_eq!(worker.service_name(), Some("A".into()));
    Ok(())
}

#[tokio::test]
async fn awaited_calls_time_out() -> Result<()> {
    let runtime = Runtime::from_current()?;
    let (near, _far) = DuplexTransport::pair();
    let worker = Worker::builder("mem").attach(Box::new(near), &runtime).await?;

    let result = worker.broker().with_async_timeout(Duration::from_millis(20)).call("time", ()).await;
    assert_eq!(result, Err(Error::Timeout));
    assert_eq!(worker.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn blocking_calls_are_refused_inside_a_runtime() -> Result<()> {
    let runtime = Runtime::from_current()?;
    let (near, _far) = DuplexTransport::pair();
    let worker = Worker::builder("mem").attach(Box::new(near), &runtime).await?;
    assert_eq!(worker.broker().call_blocking("time", ()), Err(Error::BlockingInRuntime));
    Ok(())
}

#[tokio::test]
async fn dropping_the_last_handle_closes_the_connection() -> Result<()> {
    let runtime = Runtime::from_current()?;
    let (near, far) = DuplexTransport::pair();
    let worker = Worker::builder("mem")
        .heartbeat(Duration::from_millis(50))
        .attach(Box::new(near), &runtime)
        .await?;
    let pending = worker.broker().send("time", ())?;
    drop(worker);

    assert_eq!(pending.await, Err(Error::ConnectionLost));
    // The far end drains what was already sent, then sees the close.
    let drained = tokio::time::timeout(Duration::from_secs(1), async {
        while far.recv().await?.is_some() {}
        Ok::<_, TransportError>(())
    })
    .await;
    assert!(matches!(drained, Ok(Ok(()))));
    Ok(())
}

#[tokio::test]
async fn close_after_the_connection_dropped_stops_the_heartbeat() -> Result<()> {
    let runtime = Runtime::from_current()?;
    let (near, far) = DuplexTransport::pair();
    let worker = Worker::builder("mem")
        .heartbeat(Duration::from_millis(50))
        .attach(Box::new(near), &runtime)
        .await?;
    drop(far);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(worker.is_closed());
    assert_eq!(worker.task_count(), 0);

    worker.close().await;
    assert_eq!(worker.task_count(), 0);
    Ok(())
}

#[tokio::test]
async fn service_bound_after_connecting_is_registered_by_the_heartbeat() -> Result<()> {
    init_tracing();
    let runtime = Runtime::from_current()?;
    let broker = Broker::start(BrokerConfig::default(), &runtime);
    let late = join(&broker, &runtime, Worker::builder("mem").heartbeat(Duration::from_millis(100))).await?;
    let client = join(&broker, &runtime, Worker::builder("mem")).await?;

    late.bind_service("Late", echo_service(), vec![])?;
    assert!(late.wants_service());
    assert!(!late.is_service());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(late.is_service());
    assert_eq!(client.broker().call("listServiceNames", ()).await?, Value::from(vec!["Late"]));
    assert_eq!(client.service("Late").call("echo", ["late"]).await?, Value::from("ECHO: late"));

    late.close().await;
    assert!(!late.wants_service());
    assert_eq!(client.broker().call("listServiceNames", ()).await?, Value::Array(Vec::new()));
    broker.close();
    Ok(())
}

#[tokio::test]
async fn extension_rpcs_run_on_the_broker() -> Result<()> {
    init_tracing();
    let runtime = Runtime::from_current()?;
    let rpcs = Service::builder()
        .method("echo", [Param::required("message")], |call| {
            Ok(Value::from(format!("ECHO: {}", call.str(0)?)))
        })
        .method("whatIsMyID", [], |call| Ok(Value::from(call.source.as_bytes())))
        .build();
    let broker = Broker::start_with(BrokerConfig::default(), capitalized_names().service(rpcs), &runtime);

    let server = join(&broker, &runtime, Worker::builder("mem").service("Echo", echo_service())).await?;
    let client = join(&broker, &runtime, Worker::builder("mem")).await?;

    assert_eq!(client.broker().call("echo", ["to me"]).await?, Value::from("ECHO: to me"));
    let id = server.broker().call("whatIsMyID", ()).await?;
    assert_eq!(id, client.broker().call("getAddressOfService", ["Echo"]).await?);

    assert_eq!(client.broker().call("protocol", ()).await?, Value::from("IF1"));
    let missing = client.broker().call("shutdown", ()).await;
    assert_eq!(missing, Err(Error::Remote("Function [shutdown] not available.".into())));

    let lower = join(&broker, &runtime, Worker::builder("mem").service("lower", echo_service())).await;
    assert_eq!(
        lower.err(),
        Some(Error::Remote("The first letter of the service name should be uppercase.".into()))
    );
    broker.close();
    Ok(())
}
