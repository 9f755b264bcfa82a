use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use gcp_infra_extension::controller::{
    self, Actuator, ControllerState, Dependencies, FeatureGates, KubeStatusWriter,
    KubeTerraformerFactory,
};
use gcp_infra_extension::crd::Infrastructure;
use gcp_infra_extension::gcp::{KubeCredentialsProvider, RestClientFactory};
use gcp_infra_extension::telemetry::{self, LogFormat};
use gcp_infra_extension::Error;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use tracing::{info, warn};

const DEFAULT_TERRAFORMER_IMAGE: &str =
    "europe-docker.pkg.dev/gardener-project/releases/gardener/terraformer-gcp:v2.28.0";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the Infrastructure resources handled by this controller
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace the controller runs in, holds the leader election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Image of the terraformer pods
    #[arg(long, env = "TERRAFORMER_IMAGE", default_value = DEFAULT_TERRAFORMER_IMAGE)]
    terraformer_image: String,

    /// Seconds between periodic reconciles of an unchanged Infrastructure
    #[arg(long, env = "SYNC_PERIOD_SECONDS", default_value_t = 3600)]
    sync_period_seconds: u64,

    /// Only reconcile while holding the leader election lease
    #[arg(long, env = "LEADER_ELECTION", default_value_t = true, action = ArgAction::Set)]
    leader_election: bool,

    #[arg(long, env = "LEADER_ELECTION_LEASE_NAME", default_value = "gcp-infrastructure-controller-leader")]
    lease_name: String,

    /// Do not create a service account for new shoots
    #[arg(long, env = "DISABLE_GARDENER_SERVICE_ACCOUNT_CREATION")]
    disable_gardener_service_account_creation: bool,

    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_bind_address: SocketAddr,

    /// Log output format: text or json
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Only list resources in this namespace
    #[arg(long)]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("GCP Infrastructure Controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_controller(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    let api: Api<Infrastructure> = match &args.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let infrastructures = api
        .list(&Default::default())
        .await
        .map_err(Error::KubeError)?;

    let gcp: Vec<_> = infrastructures
        .items
        .iter()
        .filter(|i| i.spec.type_ == gcp_infra_extension::crd::INFRASTRUCTURE_TYPE_GCP)
        .collect();
    println!("GCP Infrastructures: {}", gcp.len());
    Ok(())
}

async fn run_controller(args: RunArgs) -> Result<(), Error> {
    let otel_enabled = telemetry::init_tracing("gcp-infrastructure-controller", args.log_format)?;
    if otel_enabled {
        info!("OpenTelemetry tracing initialized");
    } else {
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }

    info!(
        "Starting GCP Infrastructure Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let is_leader = Arc::new(AtomicBool::new(!args.leader_election));

    if args.leader_election {
        let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });
        info!("Leader election using holder ID: {}", holder_identity);

        let election = LeaderElection {
            leases: Api::namespaced(client.clone(), &args.namespace),
            namespace: args.namespace.clone(),
            lease_name: args.lease_name.clone(),
            identity: holder_identity,
        };
        let is_leader_bg = Arc::clone(&is_leader);
        tokio::spawn(async move {
            election.run(is_leader_bg).await;
        });
    } else {
        info!("Leader election disabled");
    }

    #[cfg(feature = "metrics")]
    {
        let addr = args.metrics_bind_address;
        tokio::spawn(async move {
            if let Err(e) = gcp_infra_extension::server::run_server(addr).await {
                tracing::error!("Metrics server error: {:?}", e);
            }
        });
    }

    let status = Arc::new(KubeStatusWriter::new(client.clone()));
    let deps = Dependencies {
        credentials: Arc::new(KubeCredentialsProvider::new(client.clone())),
        terraformers: Arc::new(KubeTerraformerFactory::new(
            client.clone(),
            &args.terraformer_image,
        )),
        clouds: Arc::new(RestClientFactory::new()?),
        status: status.clone(),
        gates: FeatureGates {
            disable_gardener_service_account_creation: args
                .disable_gardener_service_account_creation,
        },
    };

    let state = Arc::new(ControllerState {
        client: client.clone(),
        actuator: Actuator::new(deps),
        status,
        is_leader: Arc::clone(&is_leader),
        sync_period: Duration::from_secs(args.sync_period_seconds),
    });

    let result = controller::run_controller(state).await;

    // Flush any remaining traces
    telemetry::shutdown_telemetry();

    result
}

const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

struct LeaderElection {
    leases: Api<Lease>,
    namespace: String,
    lease_name: String,
    identity: String,
}

impl LeaderElection {
    async fn run(&self, is_leader: Arc<AtomicBool>) {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    if !is_leader.load(Ordering::Relaxed) {
                        info!("Acquired leadership for lease {}", self.lease_name);
                    }
                    is_leader.store(true, Ordering::Relaxed);
                    tokio::time::sleep(RENEW_INTERVAL).await;
                }
                Ok(false) => {
                    if is_leader.load(Ordering::Relaxed) {
                        warn!("Lost leadership for lease {}", self.lease_name);
                    }
                    is_leader.store(false, Ordering::Relaxed);
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    warn!("Leader election error: {:?}", e);
                    is_leader.store(false, Ordering::Relaxed);
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();
        let name = self.lease_name.as_str();

        match self.leases.get(name).await {
            Ok(existing) => {
                let spec = existing.spec.as_ref();
                let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

                if current_holder == Some(self.identity.as_str()) {
                    let patch = serde_json::json!({
                        "spec": {
                            "renewTime": MicroTime(now),
                            "leaseDurationSeconds": LEASE_DURATION_SECS,
                        }
                    });
                    self.leases
                        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                    return Ok(true);
                }

                let expired = spec
                    .and_then(|s| s.renew_time.as_ref())
                    .map(|renew| {
                        let duration = spec
                            .and_then(|s| s.lease_duration_seconds)
                            .unwrap_or(LEASE_DURATION_SECS);
                        let expiry = renew.0 + chrono::Duration::seconds(duration as i64);
                        now > expiry
                    })
                    .unwrap_or(true);

                if expired {
                    info!(
                        "Lease held by {:?} has expired, taking over",
                        current_holder
                    );
                    let patch = serde_json::json!({
                        "spec": {
                            "holderIdentity": self.identity,
                            "acquireTime": MicroTime(now),
                            "renewTime": MicroTime(now),
                            "leaseDurationSeconds": LEASE_DURATION_SECS,
                        }
                    });
                    self.leases
                        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(k8s_openapi::api::coordination::v1::LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_duration_seconds: Some(LEASE_DURATION_SECS),
                        ..Default::default()
                    }),
                };
                self.leases.create(&PostParams::default(), &lease).await?;
                info!("Created lease {} with holder {}", name, self.identity);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}
