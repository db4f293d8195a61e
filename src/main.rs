use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vnode_cluster::{
    create_root_logger_for_stdout, start_cluster_worker, Acknowledgement, Broker, BrokerConfig, ClusterWorker,
    InMemoryBroker, InMemoryConnector, LevelSwitch, PartitionNumber, ProcessMessage, WorkerConfig, WorkerOptions,
};

const NODE_COUNT: u32 = 3;
const TOTAL_PARTITIONS: u32 = 24;

#[derive(Clone, Default)]
struct CountingProcessor {
    processed: Arc<AtomicUsize>,
}

impl ProcessMessage for CountingProcessor {
    fn process(&self, _: PartitionNumber, _: Bytes, ack: Acknowledgement) {
        self.processed.fetch_add(1, Ordering::AcqRel);
        ack.ack();
    }
}

#[tokio::main]
async fn main() {
    let switch = LevelSwitch::new(slog::Level::Info);
    let broker = InMemoryBroker::new();
    let processor = CountingProcessor::default();

    let mut workers: Vec<ClusterWorker<InMemoryBroker>> = Vec::new();
    for index in 1..=NODE_COUNT {
        let config = WorkerConfig {
            connector: InMemoryConnector::new(broker.clone()),
            broker_config: BrokerConfig::default(),
            processor: processor.clone(),
            node_index: index,
            node_count: NODE_COUNT,
            total_partitions: TOTAL_PARTITIONS,
            logger: create_root_logger_for_stdout(switch.clone(), format!("worker-{}", index)),
            level_switch: switch.clone(),
            options: WorkerOptions {
                table_publish_interval: Some(Duration::from_millis(200)),
                ..Default::default()
            },
        };
        workers.push(start_cluster_worker(config).await.expect("worker failed to start"));
    }

    for partition in 0..TOTAL_PARTITIONS {
        let queue = PartitionNumber::new(partition).queue_name();
        broker
            .publish(&queue, Bytes::from(format!("job for {}", queue)))
            .await
            .expect("publish failed");
    }

    // Give the ownership broadcasts a few rounds to converge.
    tokio::time::sleep(Duration::from_secs(1)).await;

    for worker in workers.iter() {
        let snapshot = worker.snapshot().await.expect("coordinator exited");
        let held: Vec<u32> = snapshot.owned_partitions.iter().map(PartitionNumber::as_u32).collect();
        println!(
            "{} holds {:?} (leader: {}), knows {} nodes",
            snapshot.local_node,
            held,
            snapshot.is_leader,
            snapshot.ownership.len()
        );
    }
    println!("Processed {} messages", processor.processed.load(Ordering::Acquire));

    for worker in workers {
        worker.stop().await.expect("worker failed to stop");
    }
}
