mod admin;
mod s3;

use self::s3::S3Storage;

use keygate::access::DocumentAccessStore;
use keygate::config::{GateConfig, GateConfigProvider, HotReloadConfigProvider};
use keygate::service::GateServiceBuilder;
use keygate::storage::{FsStorage, Storage};
use keygate::token::{JwtVerifier, KeySet, TokenSettings, cloudflare_certs_url, cloudflare_issuer};
use keygate::upstream::HttpUpstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Opt {
    /// JSON file with gate settings. Missing fields take their defaults.
    #[arg(long, env = "KEYGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    storage: StorageOpt,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct StorageOpt {
    /// Bucket holding the access control document.
    #[arg(long, env = "KEYGATE_BUCKET", required_unless_present = "fs_root")]
    bucket: Option<String>,

    /// Custom S3 endpoint, e.g. `https://<account>.r2.cloudflarestorage.com`.
    #[arg(long, env = "KEYGATE_S3_ENDPOINT")]
    endpoint_url: Option<String>,

    #[arg(long)]
    force_path_style: bool,

    /// Use a local directory as the bucket.
    #[arg(long, conflicts_with = "bucket")]
    fs_root: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gate in front of the browsing service.
    Serve(ServeOpt),
    /// Grant a prefix (or `*`) to an identity.
    Grant { identity: String, prefix: String },
    /// Revoke one prefix, or every grant of the identity.
    Revoke { identity: String, prefix: Option<String> },
    /// Print the access control document, or the grants of one identity.
    Show { identity: Option<String> },
    /// List every object key the identity can read.
    Audit { identity: String },
}

#[derive(Debug, clap::Args)]
struct ServeOpt {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value = "8080")]
    port: u16,

    /// Origin of the storage-browsing service.
    #[arg(long, env = "KEYGATE_UPSTREAM")]
    upstream: String,

    /// Cloudflare Access team domain, e.g. `acme.cloudflareaccess.com`.
    #[arg(long, env = "KEYGATE_TEAM_DOMAIN")]
    team_domain: Option<String>,

    /// Expected token issuer. Derived from the team domain if omitted.
    #[arg(long)]
    issuer: Option<String>,

    /// Accepted token audience (the Access application AUD tag). Repeatable.
    #[arg(long = "audience", env = "KEYGATE_AUDIENCE", required = true)]
    audiences: Vec<String>,

    /// JWKS endpoint. Derived from the team domain if omitted.
    #[arg(long)]
    jwks_url: Option<String>,

    /// Static JWKS file instead of fetching.
    #[arg(long, conflicts_with = "jwks_url")]
    jwks_file: Option<PathBuf>,

    /// Seconds between JWKS refreshes.
    #[arg(long, default_value = "3600")]
    jwks_refresh_secs: u64,

    /// Clock skew tolerated on token expiry, in seconds.
    #[arg(long, default_value = "60")]
    leeway_secs: u64,
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn load_config(path: Option<&PathBuf>) -> Result<GateConfig> {
    match path {
        Some(path) => GateConfig::from_json_file(path).with_context(|| format!("cannot load {}", path.display())),
        None => Ok(GateConfig::default()),
    }
}

async fn open_storage(opt: &StorageOpt) -> Result<Arc<dyn Storage>> {
    if let Some(root) = &opt.fs_root {
        let fs = FsStorage::new(root).with_context(|| format!("cannot open {}", root.display()))?;
        return Ok(Arc::new(fs));
    }
    let Some(bucket) = &opt.bucket else { bail!("either --bucket or --fs-root is required") };
    let s3 = S3Storage::from_env(bucket, opt.endpoint_url.as_deref(), opt.force_path_style).await;
    Ok(Arc::new(s3))
}

async fn fetch_jwks(client: &reqwest::Client, url: &str) -> Result<KeySet> {
    let data = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    Ok(KeySet::from_jwks(&data)?)
}

fn spawn_jwks_refresh(verifier: Arc<JwtVerifier>, client: reqwest::Client, url: String, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            match fetch_jwks(&client, &url).await {
                Ok(keys) => {
                    debug!(keys = keys.len(), "refreshed JWKS");
                    verifier.update_keys(keys);
                }
                Err(err) => warn!(%url, "JWKS refresh failed, keeping current keys: {err:#}"),
            }
        }
    });
}

async fn build_verifier(opt: &ServeOpt) -> Result<Arc<JwtVerifier>> {
    let issuer = match (&opt.issuer, &opt.team_domain) {
        (Some(issuer), _) => issuer.clone(),
        (None, Some(team)) => cloudflare_issuer(team),
        (None, None) => bail!("--issuer or --team-domain is required"),
    };
    let mut settings = TokenSettings::new(issuer, opt.audiences.clone());
    settings.leeway_secs = opt.leeway_secs;

    if let Some(path) = &opt.jwks_file {
        let data = tokio::fs::read(path).await.with_context(|| format!("cannot read {}", path.display()))?;
        let keys = KeySet::from_jwks(&data).with_context(|| format!("invalid JWKS in {}", path.display()))?;
        return Ok(Arc::new(JwtVerifier::new(settings, keys)));
    }

    let url = match (&opt.jwks_url, &opt.team_domain) {
        (Some(url), _) => url.clone(),
        (None, Some(team)) => cloudflare_certs_url(team),
        (None, None) => bail!("--jwks-url, --jwks-file or --team-domain is required"),
    };
    let client = reqwest::Client::new();
    let keys = fetch_jwks(&client, &url).await.with_context(|| format!("cannot fetch JWKS from {url}"))?;
    info!(%url, keys = keys.len(), "loaded JWKS");

    let verifier = Arc::new(JwtVerifier::new(settings, keys));
    spawn_jwks_refresh(Arc::clone(&verifier), client, url, Duration::from_secs(opt.jwks_refresh_secs.max(60)));
    Ok(verifier)
}

#[cfg(unix)]
fn spawn_config_reload(provider: Arc<HotReloadConfigProvider>, path: PathBuf) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match GateConfig::from_json_file(&path) {
                Ok(config) => {
                    provider.update(Arc::new(config));
                    info!(path = %path.display(), "reloaded config");
                }
                Err(err) => error!(path = %path.display(), "config reload failed, keeping current: {err}"),
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_config_reload(_: Arc<HotReloadConfigProvider>, _: PathBuf) -> Result<()> {
    Ok(())
}

async fn serve(opt: &ServeOpt, config: GateConfig, config_path: Option<PathBuf>, storage: Arc<dyn Storage>) -> Result<()> {
    let provider = Arc::new(HotReloadConfigProvider::new(Arc::new(config)));
    if let Some(path) = config_path {
        spawn_config_reload(Arc::clone(&provider), path)?;
    }

    let verifier = build_verifier(opt).await?;
    let upstream = HttpUpstream::new(&opt.upstream).with_context(|| format!("invalid upstream {:?}", opt.upstream))?;

    let service = {
        let mut builder = GateServiceBuilder::new(verifier, DocumentAccessStore::new(storage), upstream);
        builder.set_config(provider.clone());
        builder.build()
    };

    let addr: SocketAddr = format!("{}:{}", opt.host, opt.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let snapshot = provider.snapshot();
    info!(%local_addr, upstream = %opt.upstream, document = %snapshot.access_document_key, "server is running");

    let http_server = ConnBuilder::new(TokioExecutor::new());
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();

    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());

    loop {
        let (stream, remote_addr) = tokio::select! {
            res = listener.accept() => {
                match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!("error accepting connection: {err}");
                        continue;
                    }
                }
            }
            _ = ctrl_c.as_mut() => {
                break;
            }
        };

        debug!(%remote_addr, "accepted connection");

        let conn = http_server.serve_connection(TokioIo::new(stream), service.clone());
        let conn = graceful.watch(conn.into_owned());
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(%remote_addr, "connection error: {err}");
            }
        });
    }

    tokio::select! {
        () = graceful.shutdown() => {
            info!("Gracefully shutdown!");
        },
        () = tokio::time::sleep(Duration::from_secs(10)) => {
            info!("Waited 10 seconds for graceful shutdown, aborting...");
        }
    }

    info!("server is stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    setup_tracing();

    let config = load_config(opt.config.as_ref())?;
    let storage = open_storage(&opt.storage).await?;
    let key = config.access_document_key.clone();

    match &opt.command {
        Command::Serve(serve_opt) => serve(serve_opt, config, opt.config.clone(), storage).await?,
        Command::Grant { identity, prefix } => {
            if !admin::grant(&*storage, &key, identity, prefix).await? {
                println!("{identity} already has {prefix:?}");
            }
        }
        Command::Revoke { identity, prefix } => {
            if !admin::revoke(&*storage, &key, identity, prefix.as_deref()).await? {
                println!("nothing to revoke");
            }
        }
        Command::Show { identity } => println!("{}", admin::show(&*storage, &key, identity.as_deref()).await?),
        Command::Audit { identity } => {
            for key in admin::audit(&*storage, &key, identity).await? {
                println!("{key}");
            }
        }
    }

    Ok(())
}
