//! End-to-end control-plane scenarios against a live in-process hub.

use async_trait::async_trait;
use composite_controls::blueprint::{
    BehaviorFacet, BlueprintBuilder, BlueprintDeclaration, BlueprintHydrator, DeviceDriver,
    DeviceLogic, DriverContext, InMemoryBehaviorRegistry, InMemoryBlueprintRegistry,
};
use composite_controls::descriptor::{ActionDescriptor, LockMode, PropertyDescriptor, PropertyKind};
use composite_controls::error::{DeviceError, FailureKind};
use composite_controls::hub::{DeviceHub, ExecutionContext, TelemetryFilter};
use composite_controls::meta::{Address, Meta, Name};
use composite_controls::persistence::{StateMigrator, StateMigratorRegistry};
use composite_controls::plan::{
    ActionSpec, PlanExecutionContext, PlanExecutor, ReferenceResolver, TransactionPlan,
};
use composite_controls::ports::AllowAllAuthorization;
use composite_controls::{DeviceApi, LifecycleState};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

struct MotorDriver;

#[async_trait]
impl DeviceDriver for MotorDriver {
    async fn create(&self, _context: DriverContext) -> Result<DeviceLogic, DeviceError> {
        Ok(DeviceLogic::new()
            .with_initial("position", Meta::of(0.0))
            .with_initial("isReady", Meta::of(false))
            .with_action(
                "calibrate",
                Arc::new(|_api, _input| Box::pin(async { Ok(Meta::of("calibrated")) })),
            ))
    }
}

fn motor_v1() -> BlueprintDeclaration {
    BlueprintBuilder::new("example.motor", "1.0.0")
        .contract("example.contracts.Motor")
        .schema_version(1)
        .property(
            PropertyDescriptor::new("position", PropertyKind::Logical, "double")
                .mutable()
                .with_range(-1.0, 1.0)
                .persistent(),
        )
        .property(
            PropertyDescriptor::new("isReady", PropertyKind::Predicate, "bool").mutable(),
        )
        .property(
            PropertyDescriptor::new("counter", PropertyKind::Logical, "long")
                .mutable()
                .persistent(),
        )
        .action(ActionDescriptor::new("calibrate"))
        .build()
        .unwrap()
}

fn motor_v2() -> BlueprintDeclaration {
    BlueprintBuilder::new("example.motor.v2", "2.0.0")
        .contract("example.contracts.Motor")
        .schema_version(2)
        .property(
            PropertyDescriptor::new("position", PropertyKind::Logical, "double")
                .mutable()
                .with_range(-1.0, 1.0)
                .persistent(),
        )
        .property(
            PropertyDescriptor::new("isReady", PropertyKind::Predicate, "bool").mutable(),
        )
        .property(
            PropertyDescriptor::new("ticks", PropertyKind::Logical, "long")
                .mutable()
                .persistent(),
        )
        .action(ActionDescriptor::new("calibrate"))
        .build()
        .unwrap()
}

struct CounterRename;

impl StateMigrator for CounterRename {
    fn id(&self) -> &str {
        "motor.migrate.1to2"
    }
    fn from_version(&self) -> u32 {
        1
    }
    fn to_version(&self) -> u32 {
        2
    }
    fn migrate(&self, state: Meta) -> Result<Meta, DeviceError> {
        let mut out = Meta::new();
        for (key, nodes) in state.items() {
            let target = if key == "counter" { "ticks" } else { key.as_str() };
            for node in nodes {
                out.append(target, node.clone())?;
            }
        }
        Ok(out)
    }
}

fn motor_hub() -> DeviceHub {
    init_tracing();
    let registry = InMemoryBlueprintRegistry::new();
    registry.register(motor_v1()).unwrap();
    registry.register(motor_v2()).unwrap();
    registry.freeze();

    let behaviors = InMemoryBehaviorRegistry::new();
    for id in ["example.motor", "example.motor.v2"] {
        behaviors
            .register(id.into(), BehaviorFacet::Driver(Arc::new(MotorDriver)))
            .unwrap();
    }
    behaviors.freeze();

    let migrators = StateMigratorRegistry::new();
    migrators.register(Arc::new(CounterRename)).unwrap();
    migrators.freeze();

    DeviceHub::builder("hub")
        .provider(Arc::new(BlueprintHydrator::new(
            Arc::new(registry),
            Arc::new(behaviors),
        )))
        .authorization(Arc::new(AllowAllAuthorization))
        .migrators(Arc::new(migrators))
        .build()
        .unwrap()
}

fn name(text: &str) -> Name {
    text.parse().unwrap()
}

fn address(text: &str) -> Address {
    text.parse().unwrap()
}

// ============================================================================
// S1: attach - start - write - read - detach
// ============================================================================

#[tokio::test]
async fn attach_start_write_read_detach() {
    let hub = motor_hub();
    let ctx = ExecutionContext::new("operator");

    hub.attach(&ctx, "m", "example.motor", Meta::new()).await.unwrap();
    assert_eq!(hub.device_names().await, vec![name("m")]);

    hub.start(&ctx, "m").await.unwrap();
    let device = hub.find_device(&address("hub::m")).await.unwrap();
    assert_eq!(device.lifecycle().current(), LifecycleState::Running);

    hub.write_property(&ctx, "m", "position", Meta::of(0.5)).await.unwrap();
    let value = hub.read_property(&ctx, "m", "position").await.unwrap();
    assert_eq!(value, Meta::of(0.5));

    hub.detach(&ctx, "m").await.unwrap();
    assert!(hub.device_names().await.is_empty());
}

// ============================================================================
// S2: validation failure leaves the old value in place
// ============================================================================

#[tokio::test]
async fn out_of_range_write_is_rejected() {
    let hub = motor_hub();
    let ctx = ExecutionContext::new("operator");
    hub.attach(&ctx, "m", "example.motor", Meta::new()).await.unwrap();
    hub.start(&ctx, "m").await.unwrap();

    hub.write_property(&ctx, "m", "position", Meta::of(0.5)).await.unwrap();
    let failure = hub
        .write_property(&ctx, "m", "position", Meta::of(2.0))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Validation);

    let value = hub.read_property(&ctx, "m", "position").await.unwrap();
    assert_eq!(value, Meta::of(0.5));
}

// ============================================================================
// S3: exclusive lock contention and lease expiry
// ============================================================================

#[tokio::test]
async fn exclusive_lock_contention() {
    let hub = motor_hub();
    let alice = ExecutionContext::new("alice");
    let bob = ExecutionContext::new("bob");
    hub.attach(&alice, "m", "example.motor", Meta::new()).await.unwrap();
    let target = address("hub::m");

    let lease = hub
        .acquire_lock(&alice, &target, "axis", LockMode::ExclusiveWrite, Duration::from_millis(300))
        .await
        .unwrap();
    let failure = hub
        .acquire_lock(&bob, &target, "axis", LockMode::ExclusiveWrite, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Lock);

    // after expiry the waiter succeeds
    tokio::time::sleep(Duration::from_millis(350)).await;
    hub.acquire_lock(&bob, &target, "axis", LockMode::ExclusiveWrite, Duration::from_millis(300))
        .await
        .unwrap();
    let _ = lease;
}

// ============================================================================
// S4: hot swap with schema migration
// ============================================================================

#[tokio::test]
async fn hot_swap_migrates_persistent_state() {
    let hub = motor_hub();
    let ctx = ExecutionContext::new("operator");
    hub.attach(&ctx, "m", "example.motor", Meta::new()).await.unwrap();
    hub.start(&ctx, "m").await.unwrap();
    hub.write_property(&ctx, "m", "counter", Meta::of(3i64)).await.unwrap();

    hub.hot_swap(&ctx, "m", "example.motor.v2", Meta::new()).await.unwrap();

    let device = hub.find_device(&address("hub::m")).await.unwrap();
    assert_eq!(device.declaration().id.to_string(), "example.motor.v2");
    assert_eq!(device.lifecycle().current(), LifecycleState::Running);
    let value = hub.read_property(&ctx, "m", "ticks").await.unwrap();
    assert_eq!(value.value().and_then(composite_controls::Value::as_i64), Some(3));
}

// ============================================================================
// S5: plan with await-predicate, completing and timing out
// ============================================================================

fn calibrate_plan(timeout: Duration) -> TransactionPlan {
    TransactionPlan::new(
        "calibrate",
        ActionSpec::Sequence {
            steps: vec![
                ActionSpec::Start { device: name("m") },
                ActionSpec::AwaitPredicate {
                    address: address("hub::m"),
                    predicate: name("isReady"),
                    timeout,
                },
                ActionSpec::Invoke {
                    address: address("hub::m"),
                    action: name("calibrate"),
                    input: Meta::new(),
                    result_key: Some("calibration".into()),
                },
            ],
        },
    )
}

#[tokio::test]
async fn plan_completes_when_predicate_turns_true() {
    let hub = motor_hub();
    let ctx = ExecutionContext::new("operator");
    hub.attach(&ctx, "m", "example.motor", Meta::new()).await.unwrap();

    let device = hub.find_device(&address("hub::m")).await.unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        device.update_property(&name("isReady"), Meta::of(true)).unwrap();
    });

    let executor = PlanExecutor::new(hub.clone(), ReferenceResolver::new(hub.clone(), None));
    let pctx = PlanExecutionContext::new(ctx);
    executor
        .execute(&calibrate_plan(Duration::from_secs(5)), &pctx)
        .await
        .unwrap();
    assert_eq!(pctx.get("calibration").await, Some(Meta::of("calibrated")));
}

#[tokio::test]
async fn plan_times_out_and_leaves_device_running() {
    let hub = motor_hub();
    let ctx = ExecutionContext::new("operator");
    hub.attach(&ctx, "m", "example.motor", Meta::new()).await.unwrap();

    let executor = PlanExecutor::new(hub.clone(), ReferenceResolver::new(hub.clone(), None));
    let pctx = PlanExecutionContext::new(ctx);
    let failure = executor
        .execute(&calibrate_plan(Duration::from_millis(300)), &pctx)
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Timeout);

    let device = hub.find_device(&address("hub::m")).await.unwrap();
    assert_eq!(device.lifecycle().current(), LifecycleState::Running);
}

// ============================================================================
// S6: topic-pattern subscription
// ============================================================================

#[tokio::test]
async fn topic_subscription_sees_only_matching_devices() {
    let hub = motor_hub();
    let ctx = ExecutionContext::new("operator");
    hub.attach(&ctx, "sensors.temp", "example.motor", Meta::new()).await.unwrap();
    hub.attach(&ctx, "actuators.motor", "example.motor", Meta::new()).await.unwrap();
    hub.start(&ctx, "sensors.temp").await.unwrap();
    hub.start(&ctx, "actuators.motor").await.unwrap();

    // let start-up traffic drain before subscribing
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut subscription = hub.subscribe_topics(name("sensors.**"), 16);

    hub.write_property(&ctx, "sensors.temp", "position", Meta::of(0.1)).await.unwrap();
    hub.write_property(&ctx, "actuators.motor", "position", Meta::of(0.2)).await.unwrap();

    let mut saw_sensor_write = false;
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Some((topic, message)) = subscription.try_recv() {
        assert!(topic.starts_with(&name("sensors")));
        if matches!(message, composite_controls::DeviceMessage::PropertyChanged { .. }) {
            saw_sensor_write = true;
        }
    }
    assert!(saw_sensor_write);
}

// ============================================================================
// Authorization is fail-closed by default
// ============================================================================

#[tokio::test]
async fn default_hub_denies_everything() {
    init_tracing();
    let registry = InMemoryBlueprintRegistry::new();
    registry.register(motor_v1()).unwrap();
    let behaviors = InMemoryBehaviorRegistry::new();
    behaviors
        .register("example.motor".into(), BehaviorFacet::Driver(Arc::new(MotorDriver)))
        .unwrap();
    let hub = DeviceHub::builder("hub")
        .provider(Arc::new(BlueprintHydrator::new(
            Arc::new(registry),
            Arc::new(behaviors),
        )))
        .build()
        .unwrap();

    let ctx = ExecutionContext::new("anyone");
    let failure = hub.attach(&ctx, "m", "example.motor", Meta::new()).await.unwrap_err();
    assert_eq!(failure.kind, FailureKind::Security);
}

// ============================================================================
// Batch operations
// ============================================================================

#[tokio::test]
async fn attach_batch_rolls_back_on_failure() {
    let hub = motor_hub();
    let ctx = ExecutionContext::new("operator");
    let failure = hub
        .attach_batch(
            &ctx,
            vec![
                (name("m1"), "example.motor".into(), Meta::new()),
                (name("m2"), "example.missing".into(), Meta::new()),
            ],
        )
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Transaction);
    assert!(hub.device_names().await.is_empty());
}

#[tokio::test]
async fn batch_read_reports_per_item_results() {
    use composite_controls::hub::OperationResult;

    let hub = motor_hub();
    let ctx = ExecutionContext::new("operator");
    hub.attach(&ctx, "m", "example.motor", Meta::new()).await.unwrap();
    hub.start(&ctx, "m").await.unwrap();
    hub.write_property(&ctx, "m", "position", Meta::of(0.25)).await.unwrap();

    let mut wanted = BTreeSet::new();
    wanted.insert(name("position"));
    wanted.insert(name("missing"));
    let mut requests = BTreeMap::new();
    requests.insert(address("hub::m"), wanted);

    let results = hub.read_properties(&ctx, requests).await.unwrap();
    let per_device = &results[&address("hub::m")];
    match &per_device[&name("position")] {
        OperationResult::Success { value, .. } => assert_eq!(value, &Meta::of(0.25)),
        other => panic!("expected success, got {other:?}"),
    }
    assert!(matches!(
        per_device[&name("missing")],
        OperationResult::Failure { .. }
    ));
}

// ============================================================================
// Telemetry & aliases
// ============================================================================

#[tokio::test]
async fn telemetry_filter_delivers_matching_packets() {
    let hub = motor_hub();
    let ctx = ExecutionContext::new("operator");
    hub.attach(&ctx, "m", "example.motor", Meta::new()).await.unwrap();
    hub.start(&ctx, "m").await.unwrap();

    let mut telemetry = hub
        .subscribe_telemetry(&ctx, TelemetryFilter::devices("m").with_property("position"))
        .await
        .unwrap();

    hub.write_property(&ctx, "m", "position", Meta::of(0.4)).await.unwrap();
    let packet = tokio::time::timeout(Duration::from_secs(1), telemetry.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(packet.device, name("m"));
    assert_eq!(packet.property, name("position"));
    assert_eq!(packet.value, Meta::of(0.4));
}

#[tokio::test]
async fn alias_negotiation_routes_reads() {
    let hub = motor_hub();
    let ctx = ExecutionContext::new("operator");
    hub.attach(&ctx, "m", "example.motor", Meta::new()).await.unwrap();
    hub.start(&ctx, "m").await.unwrap();
    hub.write_property(&ctx, "m", "position", Meta::of(0.3)).await.unwrap();

    let names = hub
        .negotiate_aliases(&ctx, "m", vec![name("motor.primary")])
        .await
        .unwrap();
    assert!(names.contains(&name("m")));
    assert!(names.contains(&name("motor.primary")));

    let value = hub.read_property(&ctx, "motor.primary", "position").await.unwrap();
    assert_eq!(value, Meta::of(0.3));

    // an alias colliding with a device name is rejected
    hub.attach(&ctx, "m2", "example.motor", Meta::new()).await.unwrap();
    let failure = hub
        .negotiate_aliases(&ctx, "m", vec![name("m2")])
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::Validation);
}

// ============================================================================
// Hub data tree
// ============================================================================

#[tokio::test]
async fn data_tree_mirrors_property_writes() {
    let hub = motor_hub();
    let ctx = ExecutionContext::new("operator");
    hub.attach(&ctx, "m", "example.motor", Meta::new()).await.unwrap();
    hub.start(&ctx, "m").await.unwrap();

    hub.write_property(&ctx, "m", "position", Meta::of(0.6)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = hub.data().snapshot();
    assert_eq!(
        snapshot.get(&name("m.position")).map(|m| m.clone()),
        Some(Meta::of(0.6))
    );
}

// ============================================================================
// Composite devices: children and bindings
// ============================================================================

fn rig_blueprint() -> BlueprintDeclaration {
    use composite_controls::blueprint::{ChildConfig, ChildLifecycleOverrides, ChildPropertyBinding};

    BlueprintBuilder::new("example.rig", "1.0.0")
        .contract("example.contracts.Rig")
        .property(
            PropertyDescriptor::new("setpoint", PropertyKind::Logical, "double")
                .mutable()
                .with_range(-1.0, 1.0),
        )
        .child(
            "axis",
            ChildConfig::Local {
                blueprint: "example.motor".into(),
                version: None,
                lifecycle: ChildLifecycleOverrides::default(),
                meta: Meta::new(),
                bindings: vec![ChildPropertyBinding::Direct {
                    target: name("position"),
                    source: name("setpoint"),
                }],
            },
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn composite_attach_wires_children_and_bindings() {
    init_tracing();
    let registry = InMemoryBlueprintRegistry::new();
    registry.register(motor_v1()).unwrap();
    registry.register(rig_blueprint()).unwrap();
    let behaviors = InMemoryBehaviorRegistry::new();
    for id in ["example.motor", "example.rig"] {
        behaviors
            .register(id.into(), BehaviorFacet::Driver(Arc::new(MotorDriver)))
            .unwrap();
    }
    let hub = DeviceHub::builder("hub")
        .provider(Arc::new(BlueprintHydrator::new(
            Arc::new(registry),
            Arc::new(behaviors),
        )))
        .authorization(Arc::new(AllowAllAuthorization))
        .build()
        .unwrap();
    let ctx = ExecutionContext::new("operator");

    hub.attach(&ctx, "rig", "example.rig", Meta::new()).await.unwrap();
    assert_eq!(hub.device_names().await, vec![name("rig"), name("rig.axis")]);

    // the child is addressable under the parent name
    let child = hub.find_device(&address("hub::rig.axis")).await.unwrap();
    assert_eq!(child.declaration().id.to_string(), "example.motor");

    // a parent write flows through the direct binding into the child
    hub.start(&ctx, "rig").await.unwrap();
    hub.write_property(&ctx, "rig", "setpoint", Meta::of(0.7)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let forwarded = hub.read_property(&ctx, "rig.axis", "position").await.unwrap();
    assert_eq!(forwarded, Meta::of(0.7));

    // detach removes the whole subtree, children first
    hub.detach(&ctx, "rig").await.unwrap();
    assert!(hub.device_names().await.is_empty());
}
