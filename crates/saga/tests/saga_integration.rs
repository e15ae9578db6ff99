//! Integration tests for saga orchestration over the in-memory broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::SagaId;
use resilience::{CircuitBreaker, InMemoryIdempotencyStore, RetryPolicy};
use saga::events::{SAGA_EXCHANGE, SagaEvent};
use saga::{
    FulfillmentParticipants, InMemoryInventoryService, InMemoryPaymentService,
    InMemoryShippingService, OrderLine, OrderRequest, SagaError, SagaOrchestrator, SagaRegistry,
    StepParticipant, install_participant, order_fulfillment,
};
use serde_json::{Value, json};
use transport::{
    Binding, Connection, ConnectionConfig, ExchangeDeclaration, InMemoryBroker, QueueDeclaration,
    Topology, TransportError,
};

struct TestHarness {
    broker: InMemoryBroker,
    connection: Connection,
    orchestrator: Arc<SagaOrchestrator>,
}

impl TestHarness {
    async fn new() -> Self {
        let broker = InMemoryBroker::new();
        let connection = Connection::new(Arc::new(broker.clone()), ConnectionConfig::default());
        connection.connect().await.unwrap();

        // Sees every saga event.
        let mut audit = Topology::new();
        audit.add_exchange(ExchangeDeclaration::topic(SAGA_EXCHANGE));
        audit.add_queue(QueueDeclaration::durable("audit"));
        audit.add_binding(Binding::new("audit", SAGA_EXCHANGE, "#"));
        connection.declare_topology(audit).await.unwrap();

        let orchestrator = Arc::new(SagaOrchestrator::new(
            connection.publisher(),
            SagaRegistry::new(),
        ));
        orchestrator
            .listen(&connection, policy())
            .await
            .unwrap();

        Self {
            broker,
            connection,
            orchestrator,
        }
    }

    async fn install<P: StepParticipant + 'static>(&self, participant: P) {
        install_participant(
            &self.connection,
            participant,
            policy(),
            Arc::new(InMemoryIdempotencyStore::default()),
            1,
        )
        .await
        .unwrap();
    }

    async fn audit(&self) -> Vec<SagaEvent> {
        self.broker
            .drain("audit")
            .await
            .iter()
            .map(|m| SagaEvent::from_message(m).unwrap())
            .collect()
    }

    /// Waits until no saga is active.
    async fn settle(&self) {
        for _ in 0..200 {
            if self.orchestrator.active_count().await == 0 {
                // Let trailing compensations reach their participants.
                tokio::time::sleep(Duration::from_millis(20)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sagas still active");
    }
}

fn policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10))
}

fn steps(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Participant that records what it was asked to do.
struct Recording {
    step: String,
    fail: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl Recording {
    fn new(step: &str, fail: bool, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            step: step.to_string(),
            fail,
            log: log.clone(),
        }
    }
}

#[async_trait]
impl StepParticipant for Recording {
    fn step(&self) -> &str {
        &self.step
    }

    async fn execute(&self, _saga_id: &SagaId, data: &Value) -> saga::Result<Value> {
        self.log.lock().unwrap().push(format!("execute:{}", self.step));
        if self.fail {
            return Err(SagaError::step_failed(&self.step, "boom"));
        }
        let mut data = data.clone();
        data[&self.step] = json!(true);
        Ok(data)
    }

    async fn compensate(&self, _saga_id: &SagaId, _data: &Value) -> saga::Result<()> {
        self.log.lock().unwrap().push(format!("compensate:{}", self.step));
        Ok(())
    }
}

/// Participant whose downstream is never reachable.
struct Unreachable {
    step: String,
    calls: Arc<Mutex<u32>>,
}

#[async_trait]
impl StepParticipant for Unreachable {
    fn step(&self) -> &str {
        &self.step
    }

    async fn execute(&self, _saga_id: &SagaId, _data: &Value) -> saga::Result<Value> {
        *self.calls.lock().unwrap() += 1;
        Err(SagaError::Transport(TransportError::NotConnected))
    }

    async fn compensate(&self, _saga_id: &SagaId, _data: &Value) -> saga::Result<()> {
        Ok(())
    }
}

fn order(order_id: &str) -> OrderRequest {
    OrderRequest {
        order_id: order_id.into(),
        customer_id: "c-1".into(),
        items: vec![
            OrderLine {
                product_id: "SKU-001".into(),
                quantity: 2,
                unit_price_cents: 1000,
            },
            OrderLine {
                product_id: "SKU-002".into(),
                quantity: 1,
                unit_price_cents: 2500,
            },
        ],
    }
}

struct Services {
    inventory: InMemoryInventoryService,
    payment: InMemoryPaymentService,
    shipping: InMemoryShippingService,
}

async fn install_fulfillment(h: &TestHarness) -> Services {
    let services = Services {
        inventory: InMemoryInventoryService::new(),
        payment: InMemoryPaymentService::new(),
        shipping: InMemoryShippingService::new(),
    };
    FulfillmentParticipants {
        inventory: services.inventory.clone(),
        payment: services.payment.clone(),
        shipping: services.shipping.clone(),
        payment_breaker: Arc::new(CircuitBreaker::new("payment-gateway")),
    }
    .install(
        &h.connection,
        &policy(),
        Arc::new(InMemoryIdempotencyStore::default()),
        1,
    )
    .await
    .unwrap();
    services
}

#[tokio::test]
async fn test_failure_at_second_step_compensates_first() {
    let h = TestHarness::new().await;
    let id = SagaId::new("s1");

    h.orchestrator
        .start_saga(id.clone(), steps(&["reserve", "pay", "ship"]), json!({}))
        .await
        .unwrap();
    h.orchestrator
        .handle_step_failed(&id, "pay", "card declined")
        .await
        .unwrap();

    let keys: Vec<String> = h.audit().await.iter().map(SagaEvent::routing_key).collect();
    assert_eq!(
        keys,
        vec!["saga.reserve.execute", "saga.reserve.compensate", "saga.failed"]
    );
    assert!(h.orchestrator.status(&id).await.is_none());
    assert_eq!(h.orchestrator.active_count().await, 0);
}

#[tokio::test]
async fn test_three_step_saga_failing_at_last_compensates_in_reverse() {
    let h = TestHarness::new().await;
    let log = Arc::new(Mutex::new(Vec::new()));
    h.install(Recording::new("a", false, &log)).await;
    h.install(Recording::new("b", false, &log)).await;
    h.install(Recording::new("c", true, &log)).await;

    h.orchestrator
        .start_saga("s2".into(), steps(&["a", "b", "c"]), json!({}))
        .await
        .unwrap();
    h.settle().await;

    // Compensations land on different queues, so only their publish order
    // is deterministic.
    let mut log = log.lock().unwrap().clone();
    assert_eq!(log[..3], ["execute:a", "execute:b", "execute:c"]);
    log[3..].sort();
    assert_eq!(log[3..], ["compensate:a", "compensate:b"]);

    let stats = h.orchestrator.registry().stats().await;
    assert_eq!((stats.started, stats.failed, stats.active), (1, 1, 0));

    let events = h.audit().await;
    let compensations: Vec<String> = events
        .iter()
        .filter(|e| matches!(e, SagaEvent::Compensate(_)))
        .map(SagaEvent::routing_key)
        .collect();
    assert_eq!(compensations, vec!["saga.b.compensate", "saga.a.compensate"]);

    let failed = events.into_iter().find_map(|e| match e {
        SagaEvent::SagaFailed(d) => Some(d),
        _ => None,
    });
    let failed = failed.expect("saga.failed published");
    assert_eq!(failed.failed_step, "c");
    assert_eq!(failed.compensated_steps, steps(&["b", "a"]));
}

#[tokio::test]
async fn test_exhausted_step_retries_fail_saga_and_compensate() {
    let h = TestHarness::new().await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(Mutex::new(0));
    h.install(Recording::new("reserve", false, &log)).await;
    h.install(Unreachable {
        step: "pay".into(),
        calls: calls.clone(),
    })
    .await;

    h.orchestrator
        .start_saga("s5".into(), steps(&["reserve", "pay"]), json!({}))
        .await
        .unwrap();
    h.settle().await;

    // First attempt plus three retries.
    assert_eq!(*calls.lock().unwrap(), 4);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["execute:reserve".to_string(), "compensate:reserve".to_string()]
    );
    let stats = h.orchestrator.registry().stats().await;
    assert_eq!((stats.failed, stats.active), (1, 0));
    assert_eq!(h.broker.drain("saga.pay.dead").await.len(), 1);

    let failed = h.audit().await.into_iter().find_map(|e| match e {
        SagaEvent::SagaFailed(d) => Some(d),
        _ => None,
    });
    let failed = failed.expect("saga.failed published");
    assert_eq!(failed.failed_step, "pay");
    assert!(failed.reason.starts_with("retries exhausted"));
    assert_eq!(failed.compensated_steps, steps(&["reserve"]));
}

#[tokio::test]
async fn test_each_step_receives_previous_result() {
    let h = TestHarness::new().await;
    let log = Arc::new(Mutex::new(Vec::new()));
    h.install(Recording::new("a", false, &log)).await;
    h.install(Recording::new("b", false, &log)).await;

    h.orchestrator
        .start_saga("s3".into(), steps(&["a", "b"]), json!({"seed": 1}))
        .await
        .unwrap();
    h.settle().await;

    let completed = h.audit().await.into_iter().find_map(|e| match e {
        SagaEvent::SagaCompleted(d) => Some(d),
        _ => None,
    });
    assert_eq!(
        completed.expect("saga.completed published").result,
        json!({"seed": 1, "a": true, "b": true})
    );
    assert_eq!(h.orchestrator.registry().stats().await.completed, 1);
}

#[tokio::test]
async fn test_happy_path_full_order_fulfillment() {
    let h = TestHarness::new().await;
    let services = install_fulfillment(&h).await;

    let saga_id = order_fulfillment::start(&h.orchestrator, order("o-1"))
        .await
        .unwrap();
    assert_eq!(saga_id.as_str(), "o-1");
    h.settle().await;

    assert_eq!(services.inventory.reservation_count(), 1);
    assert_eq!(services.payment.payment_count(), 1);
    assert_eq!(services.shipping.shipment_count(), 1);

    let completed = h.audit().await.into_iter().find_map(|e| match e {
        SagaEvent::SagaCompleted(d) => Some(d),
        _ => None,
    });
    let result = completed.expect("saga.completed published").result;
    assert_eq!(result["reservation_id"], "RES-0001");
    assert_eq!(result["payment_id"], "PAY-0001");
    assert_eq!(result["tracking_number"], "TRK-000001");
}

#[tokio::test]
async fn test_payment_declined_releases_inventory() {
    let h = TestHarness::new().await;
    let services = install_fulfillment(&h).await;
    services.payment.set_fail_on_charge(true);

    order_fulfillment::start(&h.orchestrator, order("o-2"))
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(services.inventory.reservation_count(), 0);
    assert_eq!(services.payment.payment_count(), 0);
    assert_eq!(services.shipping.shipment_count(), 0);
    assert_eq!(h.orchestrator.registry().stats().await.failed, 1);
}

#[tokio::test]
async fn test_shipping_failure_refunds_and_releases() {
    let h = TestHarness::new().await;
    let services = install_fulfillment(&h).await;
    services.shipping.set_fail_on_create(true);

    order_fulfillment::start(&h.orchestrator, order("o-3"))
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(services.inventory.reservation_count(), 0);
    assert_eq!(services.payment.payment_count(), 0);
    assert_eq!(services.shipping.shipment_count(), 0);
}

#[tokio::test]
async fn test_duplicate_saga_id_rejected() {
    let h = TestHarness::new().await;
    h.orchestrator
        .start_saga("s4".into(), steps(&["a"]), json!({}))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .start_saga("s4".into(), steps(&["a"]), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, SagaError::AlreadyStarted(_)));
}
