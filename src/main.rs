//! VirtualImage operator: imports disk images into DVCR or into claims

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing::info;

use virtimage_common::crd::VirtualImage;
use virtimage_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use virtimage_controller::settings::{DvcrSettings, StorageClassSettings, UploaderSettings};
use virtimage_controller::{run, Context, ControllerSettings};

/// virtimage - provisions VirtualImages from HTTP, registries, uploads and cluster objects
#[derive(Parser, Debug)]
#[command(name = "virtimage", version, about, long_about = None)]
struct Cli {
    /// Generate the VirtualImage CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Log line format: json or text
    #[arg(long, env = "LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the VirtualImage controller
    Controller(ControllerArgs),
}

/// Controller settings, each with an environment twin
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Namespace the controller runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "d8-virtualization")]
    namespace: String,

    /// Image of the importer pod
    #[arg(long, env = "IMPORTER_IMAGE")]
    importer_image: String,

    /// Image of the uploader pod
    #[arg(long, env = "UPLOADER_IMAGE")]
    uploader_image: String,

    /// Image of the bounder pod
    #[arg(long, env = "BOUNDER_IMAGE")]
    bounder_image: String,

    /// Pull policy of helper pods
    #[arg(long, env = "IMAGE_PULL_POLICY", default_value = "IfNotPresent")]
    pull_policy: String,

    /// DVCR address, e.g. dvcr.d8-virtualization.svc
    #[arg(long, env = "DVCR_REGISTRY_URL")]
    dvcr_registry_url: String,

    /// Secret with DVCR credentials
    #[arg(long, env = "DVCR_AUTH_SECRET")]
    dvcr_auth_secret: Option<String>,

    /// Namespace of the DVCR credentials secret
    #[arg(long, env = "DVCR_AUTH_SECRET_NAMESPACE")]
    dvcr_auth_secret_namespace: Option<String>,

    /// Secret with the DVCR CA certificate
    #[arg(long, env = "DVCR_CERTS_SECRET")]
    dvcr_cert_secret: Option<String>,

    /// Skip TLS verification against DVCR
    #[arg(long, env = "DVCR_INSECURE_TLS")]
    dvcr_insecure_tls: bool,

    /// IngressClass of upload ingresses
    #[arg(long, env = "UPLOADER_INGRESS_CLASS")]
    upload_ingress_class: Option<String>,

    /// External host of the upload endpoint
    #[arg(long, env = "UPLOADER_INGRESS_HOST")]
    upload_ingress_host: String,

    /// TLS secret of upload ingresses
    #[arg(long, env = "UPLOADER_INGRESS_TLS_SECRET")]
    upload_ingress_tls_secret: Option<String>,

    /// StorageClass every volume-backed image is forced into
    #[arg(long, env = "VIRTUAL_IMAGE_STORAGE_CLASS")]
    forced_storage_class: Option<String>,

    /// StorageClasses images may request, comma separated
    #[arg(long, env = "VIRTUAL_IMAGE_ALLOWED_STORAGE_CLASSES", value_delimiter = ',')]
    allowed_storage_classes: Vec<String>,

    /// StorageClass of images that request none
    #[arg(long, env = "VIRTUAL_IMAGE_DEFAULT_STORAGE_CLASS")]
    default_storage_class: Option<String>,

    /// Cluster default StorageClass when none carries the default annotation
    #[arg(long, env = "CLUSTER_DEFAULT_STORAGE_CLASS")]
    cluster_default_storage_class: Option<String>,

    /// Seconds between DVCR presence checks of Ready images
    #[arg(long, env = "IMAGE_PRESENCE_CHECK_INTERVAL", default_value_t = 300)]
    presence_check_interval_secs: u64,

    /// Images reconciled in parallel
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = virtimage_controller::settings::DEFAULT_CONCURRENCY)]
    concurrency: u16,
}

impl ControllerArgs {
    fn into_settings(self) -> ControllerSettings {
        ControllerSettings {
            namespace: self.namespace,
            importer_image: self.importer_image,
            uploader_image: self.uploader_image,
            bounder_image: self.bounder_image,
            pull_policy: self.pull_policy,
            presence_check_interval: Duration::from_secs(self.presence_check_interval_secs),
            concurrency: self.concurrency,
            dvcr: DvcrSettings {
                registry_url: self.dvcr_registry_url,
                auth_secret: self.dvcr_auth_secret,
                auth_secret_namespace: self.dvcr_auth_secret_namespace,
                cert_secret: self.dvcr_cert_secret,
                insecure_tls: self.dvcr_insecure_tls,
            },
            storage_class: StorageClassSettings {
                forced: self.forced_storage_class,
                allowed: self
                    .allowed_storage_classes
                    .into_iter()
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect(),
                default: self.default_storage_class,
                cluster_default: self.cluster_default_storage_class,
            },
            uploader: UploaderSettings {
                ingress_class: self.upload_ingress_class,
                ingress_host: self.upload_ingress_host,
                tls_secret: self.upload_ingress_tls_secret,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&VirtualImage::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args.into_settings()).await,
        None => anyhow::bail!("no command given: run `virtimage controller` or `virtimage --crd`"),
    }
}

async fn run_controller(settings: ControllerSettings) -> anyhow::Result<()> {
    info!(
        namespace = %settings.namespace,
        dvcr = %settings.dvcr.registry_url,
        "starting virtimage controller"
    );

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let ctx = Context::builder(client.clone(), settings)
        .build()
        .context("failed to build controller context")?;

    run(client, Arc::new(ctx)).await;
    info!("shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn controller(extra: &[&str]) -> ControllerSettings {
        let mut argv = vec![
            "virtimage",
            "controller",
            "--importer-image",
            "importer:v1",
            "--uploader-image",
            "uploader:v1",
            "--bounder-image",
            "bounder:v1",
            "--dvcr-registry-url",
            "dvcr.d8-virtualization.svc",
            "--upload-ingress-host",
            "virtualization.example.com",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("valid arguments").command {
            Some(Commands::Controller(args)) => args.into_settings(),
            None => panic!("controller subcommand expected"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_fill_optional_settings() {
        let settings = controller(&[]);
        assert_eq!(settings.namespace, "d8-virtualization");
        assert_eq!(settings.pull_policy, "IfNotPresent");
        assert_eq!(settings.presence_check_interval, Duration::from_secs(300));
        assert!(!settings.dvcr.insecure_tls);
        assert!(settings.storage_class.allowed.is_empty());
    }

    #[test]
    fn storage_class_policy_is_parsed() {
        let settings = controller(&[
            "--allowed-storage-classes",
            "linstor, ceph,",
            "--default-storage-class",
            "linstor",
        ]);
        assert_eq!(settings.storage_class.allowed, vec!["linstor", "ceph"]);
        assert_eq!(settings.storage_class.default.as_deref(), Some("linstor"));
        assert_eq!(settings.storage_class.forced, None);
    }

    #[test]
    fn crd_flag_needs_no_controller_settings() {
        let cli = Cli::try_parse_from(["virtimage", "--crd"]).expect("valid arguments");
        assert!(cli.crd);
        assert!(cli.command.is_none());
    }
}
