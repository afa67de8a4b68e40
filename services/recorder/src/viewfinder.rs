//! Live MJPEG preview used to aim and focus the camera before a timelapse.

use timelapse_common::config::ViewfinderConfig;
use timelapse_common::{ExternalCommand, ExternalToolError};
use tokio::sync::watch;
use tracing::info;

/// URL a browser on the same network can open.
pub fn stream_url(hostname: &str, port: u16) -> String {
    format!("http://{hostname}:{port}/?action=stream")
}

/// `mjpg_streamer` invocation serving the camera over HTTP on `port`.
pub fn streamer_command(config: &ViewfinderConfig, port: u16) -> ExternalCommand {
    ExternalCommand::new(&config.command)
        .option(
            "-i",
            format!(
                "input_raspicam.so -x {} -y {} -fps {} -rot {} -ex auto",
                config.width, config.height, config.fps, config.rotation
            ),
        )
        .option("-o", format!("output_http.so -p {port}"))
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Run the streamer until it exits or `shutdown` turns true.
pub async fn run_viewfinder(
    config: &ViewfinderConfig,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ExternalToolError> {
    let command = streamer_command(config, port);
    let program = command.program().to_string();
    let mut child = command.spawn()?;

    info!(url = %stream_url(&hostname(), port), "Viewfinder streaming");

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|source| ExternalToolError::Io {
                program: program.clone(),
                source,
            })?;
            if !status.success() {
                return Err(ExternalToolError::Failed {
                    program,
                    status: status.to_string(),
                    stderr: String::new(),
                });
            }
        }
        _ = shutdown.wait_for(|stop| *stop) => {
            info!("Stopping viewfinder");
            child.kill().await.map_err(|source| ExternalToolError::Io { program, source })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url() {
        assert_eq!(
            stream_url("raspberrypi", 80),
            "http://raspberrypi:80/?action=stream"
        );
    }

    #[test]
    fn test_streamer_command() {
        let cmd = streamer_command(&ViewfinderConfig::default(), 8080);
        assert_eq!(
            cmd.command_line(),
            "mjpg_streamer -i input_raspicam.so -x 512 -y 384 -fps 2 -rot 180 -ex auto \
             -o output_http.so -p 8080"
        );
        assert_eq!(cmd.arguments().len(), 4);
    }
}
