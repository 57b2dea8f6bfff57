//! In-process cluster simulator: an FM, an FMM, and one reconfiguration
//! agent per node, all talking over an in-memory network.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use failover_core::agent::{InProcessHost, ReconfigurationAgent, ReplicaHost};
use failover_core::failover::{FailoverManagerId, NodeId, NodeInstance, ServiceDescription};
use failover_core::health::CollectingHealthSink;
use failover_core::jobs::AbortOnFailFast;
use failover_core::messaging::{Endpoint, InMemoryNetwork};
use failover_core::store::MemoryStore;
use failover_core::{
    logger_init, pf_error, pf_info, pf_warn, ConfigHandle, FailoverConfig, FailoverError,
    FailoverManager, ManagerBackends,
};

use log::{self, LevelFilter};

use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Number of nodes, each running a reconfiguration agent.
    #[arg(short = 'n', long, default_value_t = 5)]
    nodes: u8,

    /// Number of partitions of the simulated service.
    #[arg(short, long, default_value_t = 4)]
    partitions: u32,

    /// Target replica set size.
    #[arg(short, long, default_value_t = 3)]
    target: u32,

    /// Minimum replica set size.
    #[arg(short, long, default_value_t = 2)]
    min: u32,

    /// Node to deactivate once the service is built, if any.
    #[arg(short, long)]
    deactivate: Option<NodeId>,

    /// Seconds to wait for each scenario step.
    #[arg(long, default_value_t = 20)]
    step_secs: u64,

    /// Failover config overrides in TOML, e.g. 'rap_message_retry_interval_ms=100'.
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, returning the parsed failover
    /// config on success.
    fn sanitize(&self) -> Result<FailoverConfig, FailoverError> {
        if self.nodes == 0 {
            Err(FailoverError::msg(format!("invalid number of nodes {}", self.nodes)))
        } else if self.partitions == 0 {
            Err(FailoverError::msg(format!(
                "invalid number of partitions {}",
                self.partitions
            )))
        } else if self.target == 0 || self.min > self.target {
            Err(FailoverError::msg(format!(
                "invalid replica set sizes target {} min {}",
                self.target, self.min
            )))
        } else if self.threads < 2 {
            Err(FailoverError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else if let Some(node) = self.deactivate {
            if node == 0 || node > self.nodes as NodeId {
                Err(FailoverError::msg(format!("node to deactivate {} not in cluster", node)))
            } else {
                FailoverConfig::from_toml(self.config.as_deref())
            }
        } else {
            FailoverConfig::from_toml(self.config.as_deref())
        }
    }
}

/// Every partition of the FM has `target` ready replicas and no
/// reconfiguration in flight.
fn is_settled(fm: &FailoverManager, target: u32, avoid: Option<NodeId>) -> bool {
    let units = fm.query_failover_units();
    !units.is_empty()
        && units.iter().all(|fu| {
            !fu.is_changing_configuration()
                && fu.available_count() == target as usize
                && avoid.map_or(true, |node| !fu.hosts_replica_on(node))
        })
}

async fn wait_settled(
    fm: &FailoverManager,
    target: u32,
    avoid: Option<NodeId>,
    step: Duration,
    rx_term: &mut watch::Receiver<bool>,
) -> Result<bool, FailoverError> {
    let deadline = Instant::now() + step;
    while Instant::now() < deadline {
        if is_settled(fm, target, avoid) {
            return Ok(true);
        }
        tokio::select! {
            _ = time::sleep(Duration::from_millis(200)) => {}
            _ = rx_term.changed() => return Ok(false),
        }
    }
    Ok(false)
}

fn print_cluster(fm: &FailoverManager, agents: &[Arc<ReconfigurationAgent>]) {
    for node in fm.query_nodes() {
        println!("node {}", node);
    }
    for fu in fm.query_failover_units() {
        println!("  {}", fu);
    }
    for agent in agents {
        let replicas = agent.query_local_replicas();
        println!(
            "{}: {} local replicas, activation {:?}",
            agent.endpoint(),
            replicas.len(),
            agent.query_node_activation()
        );
    }
}

/// Actual main function of the simulator.
fn sim_main() -> Result<(), FailoverError> {
    let args = CliArgs::parse();
    let config = args.sanitize()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("sim"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-sim")
            .build()?;

        runtime.block_on(async move {
            let config = ConfigHandle::new(config);
            let net = InMemoryNetwork::new();
            let health = CollectingHealthSink::new();

            let mut managers = vec![];
            for id in [FailoverManagerId::Fm, FailoverManagerId::Fmm] {
                let rx = net.register(Endpoint::Manager(id));
                let manager = FailoverManager::new_and_setup(
                    id,
                    config.clone(),
                    net.clone(),
                    health.clone(),
                    Arc::new(AbortOnFailFast),
                    ManagerBackends::in_memory(),
                )
                .await?;
                tokio::spawn(manager.clone().run(rx, rx_term.clone()));
                managers.push(manager);
            }

            let mut agents = vec![];
            for id in 1..=args.nodes as NodeId {
                let rx = net.register(Endpoint::Node(id));
                let agent = ReconfigurationAgent::new_and_setup(
                    NodeInstance::new(id, 1),
                    config.clone(),
                    net.clone(),
                    health.clone(),
                    ReplicaHost::InProcess(InProcessHost::new()),
                    Arc::new(AbortOnFailFast),
                    MemoryStore::new(),
                )
                .await?;
                tokio::spawn(agent.clone().run(rx, rx_term.clone()));
                agents.push(agent);
            }

            let (fm, fmm) = (&managers[0], &managers[1]);
            fmm.create_service(ServiceDescription::new_stateful(
                "fm",
                1,
                args.target,
                args.min,
            ))
            .await?;
            let ids = fm
                .create_service(ServiceDescription::new_stateful(
                    "sim",
                    args.partitions,
                    args.target,
                    args.min,
                ))
                .await?;
            pf_info!("sim"; "created {} partitions on {} nodes", ids.len(), args.nodes);

            let step = Duration::from_secs(args.step_secs);
            let mut rx_wait = rx_term.clone();
            let built = wait_settled(fm, args.target, None, step, &mut rx_wait).await?;
            if !built {
                pf_warn!("sim"; "service not built within {:?}", step);
            }
            print_cluster(fm, &agents);

            if let Some(node) = args.deactivate.filter(|_| built) {
                let sequence_number = time::timeout(step, fm.deactivate_node(node)).await??;
                pf_info!("sim"; "node {} deactivated with sequence {}", node, sequence_number);
                if !wait_settled(fm, args.target, Some(node), step, &mut rx_wait).await? {
                    pf_warn!("sim"; "replicas not moved off node {} within {:?}", node, step);
                }
                print_cluster(fm, &agents);
            }

            for report in health.unhealthy() {
                pf_warn!("sim"; "unhealthy {} {:?}: {}",
                                report.entity, report.state, report.description);
            }

            for agent in &agents {
                agent.close();
            }
            for manager in &managers {
                manager.close();
            }

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), FailoverError>(())
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = sim_main() {
        pf_error!("sim"; "sim_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn args() -> CliArgs {
        CliArgs {
            nodes: 5,
            partitions: 4,
            target: 3,
            min: 2,
            deactivate: None,
            step_secs: 20,
            config: None,
            threads: 4,
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), FailoverError> {
        let config = args().sanitize()?;
        assert_eq!(config, FailoverConfig::default());
        Ok(())
    }

    #[test]
    fn sanitize_config_override() -> Result<(), FailoverError> {
        let mut args = args();
        args.config = Some("rap_message_retry_interval_ms = 100".into());
        assert_eq!(args.sanitize()?.rap_message_retry_interval_ms, 100);
        Ok(())
    }

    #[test]
    fn sanitize_invalid_sizes() {
        let mut a = args();
        a.min = 4;
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.target = 0;
        assert!(a.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_deactivate() {
        let mut a = args();
        a.deactivate = Some(6);
        assert!(a.sanitize().is_err());
        a.deactivate = Some(5);
        assert!(a.sanitize().is_ok());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let mut a = args();
        a.threads = 1;
        assert!(a.sanitize().is_err());
    }
}
