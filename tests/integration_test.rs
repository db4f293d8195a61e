use bytes::Bytes;
use std::collections::{BTreeSet, HashSet};
use std::error::Error;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use vnode_cluster::{
    Acknowledgement, Broker, ClusterWorker, CoordinatorFailure, CoordinatorSnapshot, InMemoryBroker, InMemoryConnector, NoOpProcessor,
    PartitionNumber, ProcessMessage, QueueOptions, TransportError, WorkerConfig, WorkerOptions, WorkerStartError,
};

const BROADCAST_EXCHANGE: &str = "vnode-control--broadcast";

#[tokio::test]
async fn workers_converge_on_ownership_and_leader() -> Result<(), Box<dyn Error>> {
    let broker = InMemoryBroker::new();
    let workers = start_workers(&broker, 3, 12).await?;

    let snapshots = wait_for_table_size(&workers, 3, Duration::from_secs(10)).await;

    let leader = workers[0].identity().clone();
    for (worker, snapshot) in workers.iter().zip(snapshots.iter()) {
        let initial: Vec<PartitionNumber> = worker.initial_partitions().map(PartitionNumber::new).collect();
        assert_eq!(snapshot.owned_partitions, initial);
        assert_eq!(snapshot.leader.as_ref(), Some(&leader));
        assert_eq!(snapshot.is_leader, worker.identity() == &leader);
        assert_eq!(snapshot.ownership, snapshots[0].ownership);
    }
    for partition in 0..12 {
        assert_eq!(broker.subscriber_count(&format!("vnode-{}", partition)), 1);
    }

    stop_all(workers).await;
    Ok(())
}

#[tokio::test]
async fn messages_are_processed_by_the_owning_worker() -> Result<(), Box<dyn Error>> {
    let broker = InMemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut workers = Vec::new();
    for index in 1..=2 {
        let processor = Recorder::acking(index, tx.clone());
        workers.push(vnode_cluster::start_cluster_worker(config(&broker, index, 2, 4, processor)).await?);
    }

    broker.publish("vnode-3", Bytes::from("for worker two")).await?;
    broker.publish("vnode-0", Bytes::from("for worker one")).await?;

    let first = recv(&mut rx).await;
    let second = recv(&mut rx).await;
    let mut seen = vec![first, second];
    seen.sort();
    assert_eq!(
        seen,
        vec![
            (1, PartitionNumber::new(0), Bytes::from("for worker one")),
            (2, PartitionNumber::new(3), Bytes::from("for worker two")),
        ]
    );
    assert_eq!(broker.unacked_count("vnode-0"), 0);
    assert_eq!(broker.unacked_count("vnode-3"), 0);

    stop_all(workers).await;
    Ok(())
}

#[tokio::test]
async fn leader_recovers_partitions_of_a_departed_worker() -> Result<(), Box<dyn Error>> {
    let broker = InMemoryBroker::new();
    let mut workers = start_workers(&broker, 3, 12).await?;
    wait_for_table_size(&workers, 3, Duration::from_secs(10)).await;

    let departed = workers.remove(1);
    let orphaned = departed.initial_partitions();
    departed.stop().await?;
    for partition in orphaned.clone() {
        assert_eq!(broker.subscriber_count(&format!("vnode-{}", partition)), 0);
    }
    wait_for_table_size(&workers, 2, Duration::from_secs(10)).await;

    for partition in orphaned.clone() {
        let recover = serde_json::json!({"action": "recover_vnode", "vnode_id": partition});
        broker
            .publish_to_exchange(BROADCAST_EXCHANGE, Bytes::from(serde_json::to_vec(&recover)?))
            .await?;
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let mut owned = Vec::new();
        for worker in workers.iter() {
            owned.extend(worker.snapshot().await?.owned_partitions);
        }
        let distinct: BTreeSet<PartitionNumber> = owned.iter().copied().collect();
        if owned.len() == 12 && distinct.len() == 12 {
            break;
        }
        assert!(Instant::now() < deadline, "Timeout waiting for recovery, owned {:?}", owned);
        sleep(Duration::from_millis(20)).await;
    }
    for partition in orphaned {
        assert_eq!(broker.subscriber_count(&format!("vnode-{}", partition)), 1);
    }

    stop_all(workers).await;
    Ok(())
}

#[tokio::test]
async fn status_request_reaches_every_worker() -> Result<(), Box<dyn Error>> {
    let broker = InMemoryBroker::new();
    let workers = start_workers(&broker, 2, 8).await?;
    broker.declare_queue("status-replies", QueueOptions::transient()).await?;

    let status = serde_json::json!({"action": "status", "rsvp": "status-replies"});
    broker
        .publish_to_exchange(BROADCAST_EXCHANGE, Bytes::from(serde_json::to_vec(&status)?))
        .await?;

    let deadline = Instant::now() + Duration::from_secs(10);
    while broker.ready_count("status-replies") < 2 {
        assert!(Instant::now() < deadline, "Timeout waiting for status replies");
        sleep(Duration::from_millis(20)).await;
    }

    let mut replied = HashSet::new();
    for reply in broker.drain_ready("status-replies") {
        let reply: serde_json::Value = serde_json::from_slice(&reply)?;
        assert!(reply.get("update").is_none());
        replied.insert(reply["guid"].as_str().unwrap_or_default().to_string());
    }
    let expected: HashSet<String> = workers.iter().map(|w| w.identity().id().to_string()).collect();
    assert_eq!(replied, expected);

    stop_all(workers).await;
    Ok(())
}

#[tokio::test]
async fn startup_retries_until_broker_is_reachable() -> Result<(), Box<dyn Error>> {
    let broker = InMemoryBroker::new();
    let config = config(&broker, 1, 1, 4, NoOpProcessor::new());
    config.connector.refuse_connections(2);
    let connector = config.connector.clone();

    let worker = vnode_cluster::start_cluster_worker(config).await?;

    assert_eq!(connector.connect_attempts(), 3);
    assert_eq!(connector.hard_resets(), 2);
    assert_eq!(
        worker.snapshot().await?.owned_partitions,
        (0..4).map(PartitionNumber::new).collect::<Vec<_>>()
    );

    worker.stop().await?;
    Ok(())
}

#[tokio::test]
async fn startup_gives_up_on_fatal_errors() {
    let broker = InMemoryBroker::new();
    let (tx, _rx) = mpsc::unbounded_channel();

    let refused = config(&broker, 1, 1, 4, Recorder::acking(1, tx.clone()));
    refused.connector.refuse_access();
    match vnode_cluster::start_cluster_worker(refused).await {
        Err(WorkerStartError::Transport(TransportError::AccessRefused(_))) => {}
        Err(e) => panic!("Unexpected error {}", e),
        Ok(_) => panic!("Worker should not start"),
    }

    let misplaced = config(&broker, 4, 3, 12, Recorder::acking(1, tx));
    match vnode_cluster::start_cluster_worker(misplaced).await {
        Err(WorkerStartError::InvalidPartitionRange(_)) => {}
        Err(e) => panic!("Unexpected error {}", e),
        Ok(_) => panic!("Worker should not start"),
    }
}

#[tokio::test]
async fn losing_the_broker_ends_the_worker() -> Result<(), Box<dyn Error>> {
    let broker = InMemoryBroker::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let config = config(&broker, 1, 1, 4, Recorder::acking(1, tx));
    let connector = config.connector.clone();
    let worker = vnode_cluster::start_cluster_worker(config).await?;
    assert_eq!(worker.snapshot().await?.owned_partitions.len(), 4);

    connector.sever_connections().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), worker.terminated())
        .await
        .expect("Worker should notice the broker is gone");
    assert!(matches!(
        outcome,
        Err(CoordinatorFailure::ControlChannelClosed(_)) | Err(CoordinatorFailure::Transport(_))
    ));
    assert!(worker.snapshot().await.is_err());
    for partition in 0..4 {
        assert_eq!(broker.subscriber_count(&format!("vnode-{}", partition)), 0);
    }

    assert!(worker.stop().await.is_err());
    Ok(())
}

#[tokio::test]
async fn terminated_reports_a_clean_stop() -> Result<(), Box<dyn Error>> {
    let broker = InMemoryBroker::new();
    let worker = vnode_cluster::start_cluster_worker(config(&broker, 1, 1, 2, NoOpProcessor::new())).await?;

    worker.client().stop().await?;

    let outcome = tokio::time::timeout(Duration::from_secs(5), worker.terminated()).await?;
    assert!(outcome.is_ok());
    worker.stop().await?;
    Ok(())
}

#[tokio::test]
async fn stop_waits_for_in_flight_messages() -> Result<(), Box<dyn Error>> {
    let broker = InMemoryBroker::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let processor = Recorder::holding(1, tx);
    let held = processor.held.clone().expect("Recorder holds acks");
    let worker = vnode_cluster::start_cluster_worker(config(&broker, 1, 1, 2, processor)).await?;

    broker.publish("vnode-1", Bytes::from("slow job")).await?;
    recv(&mut rx).await;
    assert_eq!(worker.in_flight().outstanding(), 1);

    let mut stopping = tokio::task::spawn(worker.stop());
    assert!(
        tokio::time::timeout(Duration::from_millis(100), &mut stopping).await.is_err(),
        "Stop should wait for the unacknowledged message"
    );

    for ack in held.lock().unwrap().drain(..) {
        ack.ack();
    }
    let stopped = tokio::time::timeout(Duration::from_secs(5), stopping)
        .await
        .expect("Stop should finish once everything is acknowledged");
    stopped??;

    assert_eq!(broker.subscriber_count("vnode-1"), 0);
    assert_eq!(broker.unacked_count("vnode-1"), 0);
    Ok(())
}

type Seen = (u32, PartitionNumber, Bytes);

struct Recorder {
    worker: u32,
    sender: mpsc::UnboundedSender<Seen>,
    held: Option<Arc<Mutex<Vec<Acknowledgement>>>>,
}

impl Recorder {
    fn acking(worker: u32, sender: mpsc::UnboundedSender<Seen>) -> Self {
        Recorder {
            worker,
            sender,
            held: None,
        }
    }

    fn holding(worker: u32, sender: mpsc::UnboundedSender<Seen>) -> Self {
        Recorder {
            worker,
            sender,
            held: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }
}

impl ProcessMessage for Recorder {
    fn process(&self, partition: PartitionNumber, payload: Bytes, ack: Acknowledgement) {
        match &self.held {
            Some(held) => held.lock().unwrap().push(ack),
            None => ack.ack(),
        }
        let _ = self.sender.send((self.worker, partition, payload));
    }
}

fn config<P: ProcessMessage>(
    broker: &InMemoryBroker,
    node_index: u32,
    node_count: u32,
    total_partitions: u32,
    processor: P,
) -> WorkerConfig<InMemoryConnector, P> {
    WorkerConfig {
        connector: InMemoryConnector::new(broker.clone()),
        broker_config: Default::default(),
        processor,
        node_index,
        node_count,
        total_partitions,
        logger: vnode_cluster::discard_logger(),
        level_switch: Default::default(),
        options: WorkerOptions {
            table_publish_interval: Some(Duration::from_millis(50)),
            reconnect_delay: Some(Duration::from_millis(10)),
            drain_poll_interval: Some(Duration::from_millis(10)),
            ..WorkerOptions::default()
        },
    }
}

async fn start_workers(
    broker: &InMemoryBroker,
    node_count: u32,
    total_partitions: u32,
) -> Result<Vec<ClusterWorker<InMemoryBroker>>, WorkerStartError> {
    let (tx, _) = mpsc::unbounded_channel();
    let mut workers = Vec::new();
    for index in 1..=node_count {
        let processor = Recorder::acking(index, tx.clone());
        let worker = vnode_cluster::start_cluster_worker(config(broker, index, node_count, total_partitions, processor));
        workers.push(worker.await?);
    }

    Ok(workers)
}

async fn wait_for_table_size(
    workers: &[ClusterWorker<InMemoryBroker>],
    expected_nodes: usize,
    timeout: Duration,
) -> Vec<CoordinatorSnapshot> {
    let deadline = Instant::now() + timeout;
    loop {
        let mut snapshots = Vec::with_capacity(workers.len());
        for worker in workers {
            snapshots.push(worker.snapshot().await.expect("Coordinator exited"));
        }
        if snapshots.iter().all(|s| s.ownership.len() == expected_nodes) {
            return snapshots;
        }

        assert!(Instant::now() < deadline, "Timeout waiting for ownership tables to converge");
        sleep(Duration::from_millis(20)).await;
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Unexpected timeout")
        .expect("Processor dropped")
}

async fn stop_all(workers: Vec<ClusterWorker<InMemoryBroker>>) {
    for worker in workers {
        worker.stop().await.expect("Worker failed to stop");
    }
}

async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}
