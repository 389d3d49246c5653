use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    core::DynamicObject,
    Client, Config, ResourceExt,
};
use lookout_core::{FieldSelector, InformerConfig, LabelSelector};
use lookout_informer::{HandlerFuncs, Informer, ReflectorState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lookoutctl", version, about = "Lookout informer CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Path to a kubeconfig file (default: in-cluster or ~/.kube/config)
    #[arg(long = "kubeconfig", global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Label selector, e.g. "app=web,tier notin (db)"
    #[arg(short = 'l', long = "selector", global = true)]
    selector: Option<String>,

    /// Field selector on metadata.name / metadata.namespace
    #[arg(long = "field-selector", global = true)]
    field_selector: Option<String>,

    /// Give up waiting for the initial list after this many seconds
    #[arg(long = "sync-timeout-secs", global = true, default_value_t = 30)]
    sync_timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print add/update/delete events for a GVK until Ctrl-C
    Watch {
        /// GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
        #[arg(default_value = "v1/Pod")]
        gvk: String,
    },
    /// Print the synced cache for a GVK and exit
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
}

fn init_tracing() {
    let env = std::env::var("LOOKOUT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LOOKOUT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid LOOKOUT_METRICS_ADDR; expected host:port");
        }
    }
}

async fn client(kubeconfig: Option<&PathBuf>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await.context("loading kubeconfig")?;
            Client::try_from(cfg).context("building kube client")
        }
        None => Client::try_default().await.context("building default kube client"),
    }
}

fn describe(o: &DynamicObject) -> String {
    match o.namespace() {
        Some(ns) => format!("{}/{}", ns, o.name_any()),
        None => o.name_any(),
    }
}

fn print_event(output: Output, event: &str, o: &DynamicObject) {
    match output {
        Output::Human => println!("{:<7} {}", event, describe(o)),
        Output::Json => {
            let line = serde_json::json!({
                "event": event,
                "namespace": o.namespace(),
                "name": o.name_any(),
                "resourceVersion": o.resource_version(),
            });
            println!("{}", line);
        }
    }
}

fn event_printer(output: Output) -> HandlerFuncs<DynamicObject> {
    HandlerFuncs::new()
        .with_add(move |o: &DynamicObject, _initial| print_event(output, "add", o))
        .with_update(move |old: &DynamicObject, new: &DynamicObject| {
            if old.resource_version() != new.resource_version() {
                print_event(output, "update", new);
            }
        })
        .with_delete(move |o: &DynamicObject| print_event(output, "delete", o))
}

fn print_cache(output: Output, items: &[std::sync::Arc<DynamicObject>]) -> Result<()> {
    let mut items: Vec<&DynamicObject> = items.iter().map(|o| o.as_ref()).collect();
    items.sort_by_key(|o| (o.namespace(), o.name_any()));
    match output {
        Output::Human => {
            println!("{:<20} {:<40} {}", "NAMESPACE", "NAME", "RV");
            for o in items {
                let ns = o.namespace().unwrap_or_else(|| "-".to_string());
                println!("{:<20} {:<40} {}", ns, o.name_any(), o.resource_version().unwrap_or_default());
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let labels = match cli.selector.as_deref() {
        Some(s) => LabelSelector::from_str(s).with_context(|| format!("parsing label selector {:?}", s))?,
        None => LabelSelector::everything(),
    };
    let fields = match cli.field_selector.as_deref() {
        Some(s) => FieldSelector::from_str(s).with_context(|| format!("parsing field selector {:?}", s))?,
        None => FieldSelector::everything(),
    };
    let (gvk, watch) = match &cli.command {
        Commands::Watch { gvk } => (gvk.clone(), true),
        Commands::Ls { gvk } => (gvk.clone(), false),
    };
    let ns = cli.namespace.as_deref();
    info!(gvk = %gvk, ns = ?ns, watch, "lookoutctl invoked");

    let config = InformerConfig::from_env();
    let client = client(cli.kubeconfig.as_ref()).await?;
    let source = lookout_kubehub::dynamic_source(client, &gvk, ns)
        .await?
        .with_config(&config)
        .with_labels(&labels)
        .with_fields(&fields);
    let informer = Informer::new(source).with_config(config);
    if watch {
        informer.add_event_handler(event_printer(cli.output));
    }

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; shutting down");
                token.cancel();
            }
        }
    });

    informer.start(&token);
    let synced = informer.wait_for_cache_sync(&token, Some(Duration::from_secs(cli.sync_timeout_secs))).await;
    if !synced {
        let interrupted = token.is_cancelled();
        token.cancel();
        informer.wait_stopped().await;
        if let ReflectorState::Failed(reason) = informer.reflector_state() {
            bail!("informer failed: {}", reason);
        }
        if !interrupted {
            bail!("cache did not sync within {}s", cli.sync_timeout_secs);
        }
        return Ok(());
    }

    let store = informer.get_store();
    let items = store.list_by_labels(&labels);
    print_cache(cli.output, &items)?;

    if watch {
        token.cancelled().await;
    } else {
        token.cancel();
    }
    informer.wait_stopped().await;
    info!("lookoutctl done");
    Ok(())
}
