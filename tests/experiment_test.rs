//! Bias image dataset experiment against simulated hardware.

use rust_cockpit::app::CockpitApp;
use rust_cockpit::config::CockpitConfig;
use rust_cockpit::error::CockpitError;
use rust_cockpit::events::Event;
use rust_cockpit::experiment::{BiasDatasetConfig, BiasDatasetExperiment, ExperimentState};
use rust_cockpit::handlers::stage::Axis;
use rust_cockpit::handlers::Handler;
use rust_cockpit::user_config::UserConfig;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const SCOPE: &str = r#"
    [[devices]]
    name = "camera"
    type = "simulated_camera"
    config = { sensor_width = 32, sensor_height = 32, exposure_ms = 2.0, readout_ms = 1.0 }

    [[devices]]
    name = "stage"
    type = "simulated_stage"

    [[devices]]
    name = "ao"
    type = "deformable_mirror"
    config = { n_modes = 10 }
"#;

async fn scope() -> CockpitApp {
    let config = CockpitConfig::from_toml_str(SCOPE).unwrap();
    let app = CockpitApp::startup_with(config, UserConfig::in_memory())
        .await
        .unwrap();
    app.depot()
        .handler("camera")
        .unwrap()
        .as_handler()
        .set_enabled(true)
        .await
        .unwrap();
    app
}

fn two_areas() -> BiasDatasetConfig {
    BiasDatasetConfig {
        bias_modes: vec![4, 5],
        applied_modes: vec![6],
        magnitude: 1.0,
        steps: 1,
        areas: 2,
        save_prefix: "T_".into(),
        ..Default::default()
    }
}

fn experiment(app: &CockpitApp, config: BiasDatasetConfig, dir: &TempDir) -> Arc<BiasDatasetExperiment> {
    Arc::new(
        BiasDatasetExperiment::new(
            config,
            Arc::clone(app.depot()),
            app.interfaces(),
            dir.path(),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn run_writes_one_stack_per_set_and_moves_between_areas() {
    let app = scope().await;
    let dir = TempDir::new().unwrap();
    let experiment = experiment(&app, two_areas(), &dir);
    assert_eq!(experiment.rep_count(), 2);

    let mut rx = app.bus().subscribe();
    let record = experiment.run().await.unwrap();

    assert_eq!(record.state, ExperimentState::Complete);
    assert_eq!(experiment.state(), ExperimentState::Complete);
    assert_eq!(record.reps_done, 2);
    // One multi-page stack per set; five pages each.
    assert_eq!(record.files.len(), 2);
    assert!(record.files.iter().all(|f| f.exists()));
    assert_eq!(record.files[0], dir.path().join("T_R2A0A6S-1.0_.tiff"));
    assert_eq!(record.files[1], dir.path().join("T_R2A1A6S-1.0_.tiff"));
    let mut decoder =
        tiff::decoder::Decoder::new(std::fs::File::open(&record.files[0]).unwrap()).unwrap();
    let mut pages = 1;
    while decoder.more_images() {
        decoder.next_image().unwrap();
        pages += 1;
    }
    assert_eq!(pages, 5);
    assert!(dir
        .path()
        .join(format!("T_{}.json", record.run_id))
        .exists());

    let stage = app.interfaces().stage.as_ref().unwrap();
    assert_eq!(stage.position_of(Axis::X).await.unwrap(), 50.0);
    assert_eq!(stage.position_of(Axis::Y).await.unwrap(), -50.0);

    let mut saw_prepare = false;
    let mut saw_complete = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            Event::PrepareForExperiment => saw_prepare = true,
            Event::ExperimentComplete { name } => {
                assert_eq!(name, "BiasImageDatasetExperiment");
                saw_complete = true;
            }
            _ => {}
        }
    }
    assert!(saw_prepare && saw_complete);
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn run_creates_a_missing_data_directory() {
    let app = scope().await;
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("not_yet_created").join("run");
    let experiment = Arc::new(
        BiasDatasetExperiment::new(
            BiasDatasetConfig {
                areas: 1,
                ..two_areas()
            },
            Arc::clone(app.depot()),
            app.interfaces(),
            &data_dir,
        )
        .unwrap(),
    );

    let record = experiment.run().await.unwrap();
    assert_eq!(record.state, ExperimentState::Complete);
    assert!(data_dir.is_dir());
    assert!(record.files.iter().all(|f| f.starts_with(&data_dir) && f.exists()));
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn unusable_data_directory_fails_before_imaging() {
    let app = scope().await;
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("a_file");
    std::fs::write(&blocker, b"x").unwrap();
    let experiment = Arc::new(
        BiasDatasetExperiment::new(
            two_areas(),
            Arc::clone(app.depot()),
            app.interfaces(),
            blocker.join("data"),
        )
        .unwrap(),
    );

    let err = experiment.run().await.unwrap_err();
    assert!(matches!(err, CockpitError::Experiment(_)));
    assert_eq!(experiment.state(), ExperimentState::Idle);
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn user_abort_stops_the_run() {
    let app = scope().await;
    let dir = TempDir::new().unwrap();
    let config = BiasDatasetConfig {
        areas: 3,
        steps: 3,
        ..two_areas()
    };
    let experiment = experiment(&app, config, &dir);

    let bus = app.bus().clone();
    let mut rx = bus.subscribe();
    let aborter = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if matches!(event, Event::NewImage { .. }) {
                bus.publish(Event::UserAbort);
                break;
            }
        }
    });

    let record = experiment.run().await.unwrap();
    aborter.await.unwrap();
    assert_eq!(record.state, ExperimentState::Aborted);
    assert!(record.reps_done < experiment.rep_count());
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn run_without_active_camera_fails_before_imaging() {
    let config = CockpitConfig::from_toml_str(SCOPE).unwrap();
    let app = CockpitApp::startup_with(config, UserConfig::in_memory())
        .await
        .unwrap();
    let dir = TempDir::new().unwrap();
    let experiment = experiment(&app, two_areas(), &dir);
    let err = experiment.run().await.unwrap_err();
    assert!(matches!(err, CockpitError::Experiment(_)));
    assert_eq!(experiment.state(), ExperimentState::Idle);
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn sweep_larger_than_the_mirror_is_rejected() {
    let app = scope().await;
    let dir = TempDir::new().unwrap();
    let config = BiasDatasetConfig {
        applied_modes: vec![12],
        ..two_areas()
    };
    let result = BiasDatasetExperiment::new(
        config,
        Arc::clone(app.depot()),
        app.interfaces(),
        dir.path(),
    );
    assert!(matches!(result, Err(CockpitError::Experiment(_))));
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_mirror_is_reported() {
    let app = scope().await;
    let dir = TempDir::new().unwrap();
    let config = BiasDatasetConfig {
        ao: "dm".into(),
        ..two_areas()
    };
    assert!(BiasDatasetExperiment::new(
        config,
        Arc::clone(app.depot()),
        app.interfaces(),
        dir.path(),
    )
    .is_err());
    app.shutdown().await.unwrap();
}
