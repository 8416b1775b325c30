use std::sync::Once;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::get_metrics_recorder;
use crate::prom::{
    spawn_proc_metrics_sampler, ArchiveMetrics, PromMetrics, BROKER_STATES, METRIC_BROKER_STATE, METRIC_MESSAGES_ERRORED, METRIC_MESSAGES_RECEIVED,
};

/// Get a handle to the global recorder, installing it as needed.
///
/// The recorder is process wide, so every test uses its own broker & topic names.
fn recorder_handle() -> Result<PrometheusHandle> {
    static INSTALL: Once = Once::new();
    let (config, _tmpdir) = Config::new_test()?;
    let recorder = get_metrics_recorder(&config);
    INSTALL.call_once(|| {
        metrics::set_recorder(recorder).expect("error setting prometheus metrics recorder");
    });
    Ok(recorder.handle())
}

/// Find the value of the sample of the given metric carrying all of the given labels.
fn sample(rendered: &str, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    rendered
        .lines()
        .filter(|line| line.starts_with(&format!("{}{{", name)))
        .filter(|line| labels.iter().all(|(key, val)| line.contains(&format!("{}=\"{}\"", key, val))))
        .find_map(|line| line.rsplit(' ').next()?.parse().ok())
}

#[test]
fn broker_state_sets_only_current_state() -> Result<()> {
    let handle = recorder_handle()?;
    let metrics = PromMetrics::default();

    metrics.broker_state("gauge-known:9092/0", "TRY_CONNECT");
    metrics.broker_state("gauge-known:9092/0", "UP");

    let rendered = handle.render();
    for state in BROKER_STATES {
        let expected = if *state == "UP" { 1.0 } else { 0.0 };
        let val = sample(&rendered, METRIC_BROKER_STATE, &[("broker", "gauge-known:9092/0"), ("state", state)])
            .with_context(|| format!("no broker state sample rendered for state {}", state))?;
        assert_eq!(val, expected, "unexpected gauge value for state {}, got {}, expected {}", state, val, expected);
    }

    Ok(())
}

#[test]
fn broker_state_clears_unknown_state_on_change() -> Result<()> {
    let handle = recorder_handle()?;
    let metrics = PromMetrics::default();

    metrics.broker_state("gauge-unknown:9092/0", "NEW_STATE");
    let rendered = handle.render();
    let val = sample(&rendered, METRIC_BROKER_STATE, &[("broker", "gauge-unknown:9092/0"), ("state", "NEW_STATE")]);
    assert_eq!(val, Some(1.0), "expected unknown state to be current, got {:?}", val);
    let val = sample(&rendered, METRIC_BROKER_STATE, &[("broker", "gauge-unknown:9092/0"), ("state", "UP")]);
    assert_eq!(val, Some(0.0), "expected known states to be cleared, got {:?}", val);

    metrics.broker_state("gauge-unknown:9092/0", "UP");
    let rendered = handle.render();
    let val = sample(&rendered, METRIC_BROKER_STATE, &[("broker", "gauge-unknown:9092/0"), ("state", "NEW_STATE")]);
    assert_eq!(val, Some(0.0), "expected previous unknown state to be cleared, got {:?}", val);
    let val = sample(&rendered, METRIC_BROKER_STATE, &[("broker", "gauge-unknown:9092/0"), ("state", "UP")]);
    assert_eq!(val, Some(1.0), "expected UP to be current, got {:?}", val);

    Ok(())
}

#[test]
fn broker_state_repeated_unknown_state_stays_current() -> Result<()> {
    let handle = recorder_handle()?;
    let metrics = PromMetrics::default();

    metrics.broker_state("gauge-repeat:9092/0", "NEW_STATE");
    metrics.broker_state("gauge-repeat:9092/0", "NEW_STATE");

    let val = sample(&handle.render(), METRIC_BROKER_STATE, &[("broker", "gauge-repeat:9092/0"), ("state", "NEW_STATE")]);
    assert_eq!(val, Some(1.0), "expected repeated unknown state to stay current, got {:?}", val);

    Ok(())
}

#[test]
fn message_counters_are_labeled_by_topic_and_partition() -> Result<()> {
    let handle = recorder_handle()?;
    let metrics = PromMetrics::default();

    metrics.message_received("counter_topic", 0);
    metrics.message_received("counter_topic", 0);
    metrics.message_received("counter_topic", 3);
    metrics.message_errored("counter_topic", 3);

    let rendered = handle.render();
    let val = sample(&rendered, METRIC_MESSAGES_RECEIVED, &[("topic", "counter_topic"), ("partition", "0")]);
    assert_eq!(val, Some(2.0), "unexpected received count for partition 0, got {:?}", val);
    let val = sample(&rendered, METRIC_MESSAGES_RECEIVED, &[("topic", "counter_topic"), ("partition", "3")]);
    assert_eq!(val, Some(1.0), "unexpected received count for partition 3, got {:?}", val);
    let val = sample(&rendered, METRIC_MESSAGES_ERRORED, &[("topic", "counter_topic"), ("partition", "3")]);
    assert_eq!(val, Some(1.0), "unexpected errored count for partition 3, got {:?}", val);
    let val = sample(&rendered, METRIC_MESSAGES_ERRORED, &[("topic", "counter_topic"), ("partition", "0")]);
    assert_eq!(val, None, "expected no errored series for partition 0, got {:?}", val);

    Ok(())
}

#[cfg(target_os = "linux")]
#[test]
fn proc_metrics_are_collected() -> Result<()> {
    use crate::prom::{collect_proc_metrics, METRIC_OPEN_FDS, METRIC_RESIDENT_MEMORY_BYTES, METRIC_THREADS};

    let handle = recorder_handle()?;

    collect_proc_metrics()?;

    let rendered = handle.render();
    for name in [METRIC_OPEN_FDS, METRIC_RESIDENT_MEMORY_BYTES, METRIC_THREADS] {
        let val = sample(&rendered, name, &[]).with_context(|| format!("no sample rendered for {}", name))?;
        assert!(val > 0.0, "expected a positive sample for {}, got {}", name, val);
    }

    Ok(())
}

#[tokio::test]
async fn proc_metrics_sampler_stops_on_shutdown() -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let sampler = spawn_proc_metrics_sampler(async move {
        let _res = shutdown_rx.recv().await;
    });

    shutdown_tx.send(()).context("error sending shutdown signal")?;
    tokio::time::timeout(Duration::from_secs(5), sampler)
        .await
        .context("timeout while waiting for process metrics sampler to shutdown")?
        .context("error joining process metrics sampler handle")?;

    Ok(())
}
