use clap::{Parser, Subcommand};
use plant_identify::config::{ExecutionMode, IdentifyConfig};
use plant_identify::error::{Error, Result};
use plant_identify::onnx::ort_runtime_version;
use plant_identify::preprocess::{is_supported_image, SourceImage};
use plant_identify::remote::RemoteClient;
use plant_identify::Identifier;
use std::path::PathBuf;
use std::time::Duration;

/// Identify medicinal plant species from a photograph.
#[derive(Parser, Debug)]
#[command(name = "plant-identify", version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "PLANT_ID_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify an image and print the top predictions as JSON
    Identify {
        image: PathBuf,

        /// Send the image to the inference service instead of running locally
        #[arg(long)]
        remote: bool,

        /// Number of predictions to return
        #[arg(long)]
        top_k: Option<usize>,

        /// ONNX model file
        #[arg(long)]
        model: Option<PathBuf>,

        /// Label vocabulary (JSON array or one label per line)
        #[arg(long)]
        labels: Option<PathBuf>,

        /// Inference service base URL
        #[arg(long)]
        url: Option<String>,
    },
    /// Ask the remedy service about symptoms
    Remedy {
        #[arg(required = true)]
        symptoms: Vec<String>,

        #[arg(long)]
        url: Option<String>,
    },
    /// Print the resolved configuration and ONNX Runtime version
    Info,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::debug!("{e:?}");
        eprintln!("{}", e.user_message());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = IdentifyConfig::discover(cli.config.as_deref())?;
    match cli.command {
        Command::Identify {
            image,
            remote,
            top_k,
            model,
            labels,
            url,
        } => {
            if remote {
                config.mode = ExecutionMode::Remote;
            }
            if let Some(k) = top_k {
                config.top_k = k;
            }
            if let Some(path) = model {
                config.model_path = path;
            }
            if let Some(path) = labels {
                config.labels_path = path;
            }
            if let Some(url) = url {
                config.remote_url = url;
            }
            config.validate()?;
            identify(&config, image).await
        }
        Command::Remedy { symptoms, url } => {
            if let Some(url) = url {
                config.remote_url = url;
            }
            let client = RemoteClient::new(
                &config.remote_url,
                Duration::from_secs(config.remote_timeout_secs),
            )?;
            let text = client.request_remedy(&symptoms.join(", ")).await?;
            println!("{text}");
            Ok(())
        }
        Command::Info => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            match ort_runtime_version() {
                Some(version) => println!("onnxruntime {version}"),
                None => println!("onnxruntime not found (set ORT_DYLIB_PATH)"),
            }
            Ok(())
        }
    }
}

async fn identify(config: &IdentifyConfig, path: PathBuf) -> Result<()> {
    if !is_supported_image(&path) {
        return Err(Error::Decode(format!(
            "Unsupported file type: {}",
            path.display()
        )));
    }
    let image = SourceImage::open(&path).await?;
    log::info!(
        "Loaded {} ({}x{})",
        path.display(),
        image.width(),
        image.height()
    );

    let identifier = Identifier::from_config(config)?;
    if config.mode == ExecutionMode::Local {
        identifier.warm_up().await?;
    }
    let outcome = identifier.identify(&image, config.mode).await?;
    let Some(predictions) = identifier.accept(outcome) else {
        return Ok(());
    };
    if predictions.is_empty() {
        eprintln!("No plant could be identified in this image.");
    }
    println!("{}", serde_json::to_string_pretty(&predictions)?);
    Ok(())
}
