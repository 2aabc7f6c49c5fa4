//! End-to-end calibration tests against the simulated printer.

mod common;

use auto_z_offset::calibration::{
    CalibrationState, OffsetMeasurementRound, SessionFlag, StateTracker,
};
use auto_z_offset::config::{AggregationMethod, AutoZConfig, TolerancePolicy};
use auto_z_offset::hardware::capabilities::ConfigStore;
use auto_z_offset::hardware::mock::{BedModel, SimulatedPrinter, DEFAULT_PROBE_TRIGGER};
use auto_z_offset::storage::{MemoryConfigStore, TomlConfigStore};
use auto_z_offset::{AutoZCommand, AutoZError, AutoZOffset};
use common::{approx, module_with_memory_store, stored_offset, FailingStore, SECTION};
use std::io::Write;
use std::sync::Arc;

#[tokio::test]
async fn derived_diff_is_independent_of_reference_point() {
    let mut diffs = Vec::new();
    for reference_xy in [[120.0, 120.0], [60.0, 200.0], [200.0, 40.0]] {
        let printer = SimulatedPrinter::new();
        printer
            .set_bed(BedModel {
                height: 0.3,
                ..Default::default()
            })
            .await;
        let hw = printer.collaborators(Arc::new(MemoryConfigStore::new()));
        let round = OffsetMeasurementRound::new(&AutoZConfig {
            reference_xy,
            ..Default::default()
        });

        let report = round
            .run(&hw, &SessionFlag::default(), &StateTracker::new())
            .await
            .unwrap();
        diffs.push(report.result.derived_diff);
    }

    for diff in &diffs {
        assert!(approx(*diff, diffs[0], 1e-9), "diffs differ: {:?}", diffs);
    }
}

#[tokio::test]
async fn missing_compensation_shifts_probe_offset_only() {
    let tilted = BedModel {
        height: 0.0,
        tilt_x: 0.01,
        tilt_y: 0.0,
    };
    let mut results = Vec::new();
    for xy_compensation in [true, false] {
        let printer = SimulatedPrinter::new();
        printer.set_bed(tilted).await;
        let hw = printer.collaborators(Arc::new(MemoryConfigStore::new()));
        let round = OffsetMeasurementRound::new(&AutoZConfig {
            xy_compensation,
            ..Default::default()
        });
        let report = round
            .run(&hw, &SessionFlag::default(), &StateTracker::new())
            .await
            .unwrap();
        results.push(report.result);
    }

    let (good, bad) = (results[0], results[1]);
    assert!(approx(good.bed_sensor_offset, bad.bed_sensor_offset, 1e-9));
    // Uncompensated, the probe tip lands 25mm further along the slope
    assert!(approx(bad.probe_offset - good.probe_offset, 0.25, 1e-9));
}

#[tokio::test]
async fn calibrate_while_session_pending_does_not_move() {
    let printer = SimulatedPrinter::new();
    let (mut module, store) = module_with_memory_store(&printer, AutoZConfig::default());
    module.session().try_begin().unwrap();

    let err = module.dispatch(AutoZCommand::Calibrate).await.unwrap_err();

    assert!(matches!(err, AutoZError::SessionAlreadyActive));
    assert_eq!(printer.move_count().await, 0);
    assert_eq!(printer.gcode_z_offset().await, 0.0);
    assert_eq!(stored_offset(&*store), None);
    // The session that was already pending is untouched
    assert!(module.session().is_pending());
}

#[tokio::test]
async fn probe_failure_mid_round_leaves_offsets_unchanged() {
    let printer = SimulatedPrinter::new();
    printer.set_gcode_z_offset(-0.2).await;
    printer.fail_probe(true).await;
    let (mut module, store) = module_with_memory_store(
        &printer,
        AutoZConfig {
            calibrated_z_offset: 0.3,
            ..Default::default()
        },
    );
    store
        .set(SECTION, "calibrated_z_offset", "0.300000")
        .unwrap();

    let err = module.dispatch(AutoZCommand::Calibrate).await.unwrap_err();

    assert!(matches!(err, AutoZError::ProbeTriggerFailure { .. }));
    assert_eq!(printer.gcode_z_offset().await, -0.2);
    assert_eq!(stored_offset(&*store).as_deref(), Some("0.300000"));
    let status = module.status().await;
    assert_eq!(status.calibrated_z_offset, 0.3);
    assert_eq!(status.state, CalibrationState::Idle);
    assert!(!status.session_pending);
    assert!(!printer.sensor_session_active().await);
}

#[tokio::test]
async fn load_then_save_keeps_persisted_value() {
    let printer = SimulatedPrinter::new();
    let (mut module, store) = module_with_memory_store(
        &printer,
        AutoZConfig {
            calibrated_z_offset: 0.731,
            ..Default::default()
        },
    );
    store
        .set(SECTION, "calibrated_z_offset", "0.731000")
        .unwrap();

    module.dispatch(AutoZCommand::LoadOffset).await.unwrap();
    assert!(approx(printer.gcode_z_offset().await, -0.731, 1e-9));
    module.dispatch(AutoZCommand::SaveGcodeOffset).await.unwrap();

    assert_eq!(stored_offset(&*store).as_deref(), Some("0.731000"));
    assert!(approx(module.calibrated_z_offset(), 0.731, 1e-9));
}

#[tokio::test]
async fn save_captures_manual_adjustment() {
    let printer = SimulatedPrinter::new();
    let (mut module, store) = module_with_memory_store(&printer, AutoZConfig::default());
    printer.set_gcode_z_offset(-1.1).await;

    let response = module
        .dispatch(AutoZCommand::SaveGcodeOffset)
        .await
        .unwrap();

    assert_eq!(
        response.lines[0],
        "auto_z_offset: calibrated_z_offset: 1.100000"
    );
    assert_eq!(stored_offset(&*store).as_deref(), Some("1.100000"));
}

#[tokio::test]
async fn tolerance_exceeded_aborts_calibration() {
    let printer = SimulatedPrinter::new();
    printer.queue_bed_noise([0.0, 0.05, 0.2]).await;
    let (mut module, store) = module_with_memory_store(
        &printer,
        AutoZConfig {
            samples: 3,
            samples_tolerance: 0.1,
            ..Default::default()
        },
    );

    let err = module.dispatch(AutoZCommand::Calibrate).await.unwrap_err();

    match err {
        AutoZError::ToleranceExceeded {
            spread, retries, ..
        } => {
            assert!(approx(spread, 0.2, 1e-9));
            assert_eq!(retries, 0);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(printer.gcode_z_offset().await, 0.0);
    assert_eq!(stored_offset(&*store), None);
}

#[tokio::test]
async fn tolerance_retry_recovers() {
    let printer = SimulatedPrinter::new();
    printer
        .queue_bed_noise([0.0, 0.05, 0.2, 0.01, 0.02, 0.03])
        .await;
    let (mut module, _store) = module_with_memory_store(
        &printer,
        AutoZConfig {
            samples: 3,
            samples_result: AggregationMethod::Median,
            samples_tolerance: 0.1,
            samples_tolerance_retries: 1,
            ..Default::default()
        },
    );

    let response = module.dispatch(AutoZCommand::Probe).await.unwrap();

    // Median of the second set is the 0.02 sample
    assert!(approx(response.value.unwrap(), -0.02, 1e-9));
    assert_eq!(printer.probe_counts().await, (6, 0));
}

#[tokio::test]
async fn warn_policy_reports_and_continues() {
    let printer = SimulatedPrinter::new();
    printer.queue_probe_noise([0.0, 0.4]).await;
    let (mut module, _store) = module_with_memory_store(
        &printer,
        AutoZConfig {
            samples: 2,
            samples_result: AggregationMethod::Median,
            samples_tolerance: 0.1,
            offset_samples: 1,
            tolerance_policy: TolerancePolicy::Warn,
            ..Default::default()
        },
    );

    let response = module.dispatch(AutoZCommand::Calibrate).await.unwrap();

    assert!(response.lines[0].starts_with("probe: samples spread 0.400000"));
    assert!(approx(response.value.unwrap(), DEFAULT_PROBE_TRIGGER, 1e-9));
}

#[tokio::test]
async fn persistence_failure_keeps_live_offset() {
    let printer = SimulatedPrinter::new();
    let hw = printer.collaborators(Arc::new(FailingStore));
    let mut module = AutoZOffset::new(AutoZConfig::default(), hw).unwrap();

    let err = module.dispatch(AutoZCommand::Calibrate).await.unwrap_err();

    assert!(matches!(err, AutoZError::Persistence { .. }));
    assert!(!err.is_session_fatal());
    assert!(approx(printer.gcode_z_offset().await, -DEFAULT_PROBE_TRIGGER, 1e-6));
    assert!(approx(module.calibrated_z_offset(), DEFAULT_PROBE_TRIGGER, 1e-9));
}

#[tokio::test]
async fn calibrated_value_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.toml");
    let mut printer_cfg = tempfile::NamedTempFile::new().unwrap();
    writeln!(printer_cfg, "[auto_z_offset]\noffset_samples = 2\nsamples = 3").unwrap();

    {
        let config = AutoZConfig::load_with_state(printer_cfg.path(), &state, SECTION).unwrap();
        let printer = SimulatedPrinter::new();
        let store = Arc::new(TomlConfigStore::new(&state));
        let mut module = AutoZOffset::new(config, printer.collaborators(store)).unwrap();
        module.dispatch(AutoZCommand::Calibrate).await.unwrap();
    }

    let config = AutoZConfig::load_with_state(printer_cfg.path(), &state, SECTION).unwrap();
    assert!(approx(config.calibrated_z_offset, DEFAULT_PROBE_TRIGGER, 1e-6));

    let printer = SimulatedPrinter::new();
    let store = Arc::new(TomlConfigStore::new(&state));
    let mut module = AutoZOffset::new(config, printer.collaborators(store)).unwrap();
    module.dispatch(AutoZCommand::LoadOffset).await.unwrap();
    assert!(approx(printer.gcode_z_offset().await, -DEFAULT_PROBE_TRIGGER, 1e-6));
}

#[tokio::test]
async fn jittery_sensors_converge_with_median() {
    let printer = SimulatedPrinter::new().with_jitter(42, 0.005).await;
    let (mut module, _store) = module_with_memory_store(
        &printer,
        AutoZConfig {
            samples: 5,
            samples_result: AggregationMethod::Median,
            samples_tolerance: 0.05,
            ..Default::default()
        },
    );

    let response = module.dispatch(AutoZCommand::Calibrate).await.unwrap();

    assert!(approx(response.value.unwrap(), DEFAULT_PROBE_TRIGGER, 0.03));
}

#[tokio::test]
async fn bed_sensor_sessions_run_prepare_gcode_and_restore_accel() {
    let printer = SimulatedPrinter::new();
    let (mut module, _store) = module_with_memory_store(
        &printer,
        AutoZConfig {
            offset_samples: 1,
            probe_accel: 50.0,
            prepare_gcode: Some("RESPOND MSG=prepare_{name}".to_string()),
            ..Default::default()
        },
    );

    module.dispatch(AutoZCommand::Calibrate).await.unwrap();

    let scripts = printer.scripts().await;
    assert_eq!(scripts[0], "RESPOND MSG=prepare_auto_z_offset");
    assert_eq!(scripts[1], "M204 S50.000");
    assert_eq!(scripts[2], "M204 S3000.000");
    assert!(scripts[3].starts_with("SET_GCODE_OFFSET Z=-1.25"));
    assert_eq!(printer.motion().max_accel().await.unwrap(), 3000.0);
    assert!(!module.status().await.accel_override_active);
}

#[tokio::test]
async fn status_serializes_to_json() {
    let printer = SimulatedPrinter::new();
    let (mut module, _store) = module_with_memory_store(&printer, AutoZConfig::default());
    module.dispatch(AutoZCommand::HomeZ).await.unwrap();

    let json = serde_json::to_value(module.status().await).unwrap();

    assert_eq!(json["name"], "auto_z_offset");
    assert_eq!(json["state"], "idle");
    assert_eq!(json["session_pending"], false);
    assert!(json["last_z_result"].is_number());
}

#[tokio::test]
async fn dispatch_line_rejects_unknown_commands() {
    let printer = SimulatedPrinter::new();
    let (mut module, _store) = module_with_memory_store(&printer, AutoZConfig::default());

    let err = module.dispatch_line("AUTO_Z_EXPLODE").await.unwrap_err();
    assert!(matches!(err, AutoZError::UnknownCommand(_)));

    let response = module.dispatch_line("auto_z_load_offset").await.unwrap();
    assert_eq!(response.value, Some(0.0));
}
