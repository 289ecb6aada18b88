//! Thin reference client: submit a project zip, stream or replay a job's logs.
//!
//! SSE parsing reads the chunked body line by line, grounded on the ambient stack's choice of
//! `reqwest` in streaming mode for exactly this purpose.

use std::path::Path;

use ci_runner::config::{ClientCommand, ClientConfig};
use ci_runner::model::{Job, StreamEvent};
use clap::Parser;
use futures::StreamExt;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ClientConfig::parse();
    let exit_code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(config: ClientConfig) -> anyhow::Result<i32> {
    let api_key = config.resolve_api_key()?;
    let client = reqwest::Client::new();

    match config.command {
        ClientCommand::Submit { zip_path } => {
            let resp = submit(&client, &config.server_url, &api_key, &zip_path, "submit-stream").await?;
            tokio::select! {
                result = consume_sse(resp) => result,
                _ = tokio::signal::ctrl_c() => Ok(130),
            }
        }
        ClientCommand::SubmitAsync { zip_path } => {
            let resp = submit(&client, &config.server_url, &api_key, &zip_path, "submit-async").await?;
            let body: serde_json::Value = resp.json().await?;
            println!("{body}");
            Ok(0)
        }
        ClientCommand::Stream { job_id, from_beginning } => {
            let resp = client
                .get(format!(
                    "{}/jobs/{job_id}/stream?from_beginning={from_beginning}",
                    config.server_url
                ))
                .bearer_auth(&api_key)
                .send()
                .await?
                .error_for_status()?;
            tokio::select! {
                result = consume_sse(resp) => result,
                _ = tokio::signal::ctrl_c() => Ok(130),
            }
        }
        ClientCommand::Get { job_id } => {
            let resp = client
                .get(format!("{}/jobs/{job_id}", config.server_url))
                .bearer_auth(&api_key)
                .send()
                .await?
                .error_for_status()?;
            let job: Job = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(0)
        }
        ClientCommand::List => {
            let resp = client
                .get(format!("{}/jobs", config.server_url))
                .bearer_auth(&api_key)
                .send()
                .await?
                .error_for_status()?;
            let jobs: Vec<Job> = resp.json().await?;
            for job in jobs {
                println!("{}\t{}\t{:?}", job.id, job.status, job.success);
            }
            Ok(0)
        }
    }
}

async fn submit(
    client: &reqwest::Client,
    server_url: &str,
    api_key: &str,
    zip_path: &Path,
    endpoint: &str,
) -> anyhow::Result<reqwest::Response> {
    let bytes = tokio::fs::read(zip_path).await?;
    let file_name = zip_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project.zip".to_string());
    let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
    let form = reqwest::multipart::Form::new().part("file", part);

    let resp = client
        .post(format!("{server_url}/{endpoint}"))
        .bearer_auth(api_key)
        .multipart(form)
        .send()
        .await?
        .error_for_status()?;
    Ok(resp)
}

/// Read a chunked `text/event-stream` body, printing log lines as they arrive, and return the
/// process exit code implied by the terminal `complete` event (0 success, 1 failure).
async fn consume_sse(resp: reqwest::Response) -> anyhow::Result<i32> {
    let mut stream = resp.bytes_stream();
    let mut buf = String::new();
    let mut exit_code = 1;

    while let Some(chunk) = stream.next().await {
        buf.push_str(&String::from_utf8_lossy(&chunk?));

        while let Some(pos) = buf.find("\n\n") {
            let frame = buf[..pos].to_string();
            buf.drain(..pos + 2);

            for line in frame.lines() {
                let Some(json) = line.strip_prefix("data: ") else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<StreamEvent>(json) else {
                    continue;
                };
                match event {
                    StreamEvent::JobId { job_id } => println!("job_id: {job_id}"),
                    StreamEvent::Log { data } => print!("{data}"),
                    StreamEvent::Complete { success } => {
                        exit_code = if success { 0 } else { 1 };
                    }
                }
            }
        }
    }

    Ok(exit_code)
}
