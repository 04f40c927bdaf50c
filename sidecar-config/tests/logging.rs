use std::{
    io,
    sync::{Arc, Mutex},
};

use sidecar_config::{
    ConfigLoad, ConfigSource, ConfigWarnings, LoggingConfig, SidecarConfig, init_tracing,
};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        let bytes = self.0.lock().expect("capture lock").clone();
        String::from_utf8(bytes).expect("utf8 log output")
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("capture lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn subscriber_installs_once() {
    let config = LoggingConfig {
        default_directive: "sidecar_core=debug".into(),
        ansi: false,
    };
    init_tracing(&config).expect("first install");
    tracing::info!("subscriber installed");
    assert!(init_tracing(&config).is_err());
}

#[test]
fn load_report_names_the_source_and_each_warning() {
    let mut warnings = ConfigWarnings::default();
    warnings.push("storage_client.concurrency is very high");
    warnings.push_with_hint(
        "restore_job.job_ttl_secs is shorter than a day",
        "raise it unless jobs are tiny",
    );
    let load = ConfigLoad {
        config: SidecarConfig::default(),
        source: ConfigSource::Discovered("config/sidecar.toml".into()),
        warnings,
    };

    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, || load.report());

    let output = captured.text();
    assert!(output.contains("source=config/sidecar.toml"), "{output}");
    assert!(output.contains("storage_client.concurrency is very high"), "{output}");
    assert!(output.contains("hint=raise it unless jobs are tiny"), "{output}");
    assert_eq!(output.matches("WARN").count(), 2, "{output}");
}
