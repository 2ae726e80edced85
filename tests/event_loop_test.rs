//! Console commands driven through the event loop of a running application.

use rust_cockpit::app::CockpitApp;
use rust_cockpit::config::CockpitConfig;
use rust_cockpit::events::Event;
use rust_cockpit::gui::commands::{parse_command, UiCommand};
use rust_cockpit::gui::event_loop::{CommandReply, ExitReason};
use rust_cockpit::handlers::stage::Axis;
use rust_cockpit::handlers::Handler;
use rust_cockpit::user_config::UserConfig;
use std::time::Duration;
use tokio::sync::mpsc;

const SCOPE: &str = r#"
    [application]
    name = "Loop Scope"

    [[devices]]
    name = "camera"
    type = "simulated_camera"
    config = { sensor_width = 32, sensor_height = 32, exposure_ms = 2.0, readout_ms = 1.0 }

    [[devices]]
    name = "stage"
    type = "simulated_stage"

    [[devices]]
    name = "piezo"
    type = "simulated_stage"
    [[devices.config.axes]]
    axis = "z"
    min = 0.0
    max = 100.0

    [[devices]]
    name = "488"
    type = "simulated_light"
    config = { max_power = 100.0 }

    [[devices]]
    name = "objectives"
    type = "objectives"
    [[devices.config.objectives]]
    name = "10x"
    pixel_size = 0.65
    [[devices.config.objectives]]
    name = "60x"
    pixel_size = 0.108

    [[devices]]
    name = "clarity"
    type = "clarity"
    config = { camera = "camera", "filter cubes" = ["DAPI", "GFP", "mCherry", "Cy5"] }
"#;

async fn scope() -> CockpitApp {
    let config = CockpitConfig::from_toml_str(SCOPE).unwrap();
    CockpitApp::startup_with(config, UserConfig::in_memory())
        .await
        .unwrap()
}

struct Console {
    tx: mpsc::Sender<UiCommand>,
    replies: mpsc::UnboundedReceiver<CommandReply>,
}

impl Console {
    async fn say(&mut self, line: &str) -> Result<String, String> {
        let command = parse_command(line).unwrap().unwrap();
        self.tx.send(command).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.replies.recv())
            .await
            .unwrap()
            .unwrap()
            .outcome
    }
}

fn console() -> (
    Console,
    mpsc::Receiver<UiCommand>,
    mpsc::UnboundedSender<CommandReply>,
) {
    let (tx, rx) = mpsc::channel(8);
    let (reply_tx, replies) = mpsc::unbounded_channel();
    (Console { tx, replies }, rx, reply_tx)
}

#[tokio::test]
async fn stage_and_handler_commands() {
    let app = scope().await;
    let (mut console, rx, reply_tx) = console();

    let session = async {
        assert!(console.say(r#"enable "488""#).await.unwrap().contains("enabled"));
        assert_eq!(console.say("power 488 25").await.unwrap(), "488 power 25 mW");

        console.say("move x 120").await.unwrap();
        console.say("mover 1").await.unwrap();
        console.say("moverel z 7.5").await.unwrap();
        console.say("stepsize 3").await.unwrap();
        console.say("step z +").await.unwrap();
        assert!(console.say("mover 5").await.is_err());
        assert!(console.say("moverel z 500").await.is_err());

        assert!(console.say("objective 1").await.unwrap().contains("60x"));
        assert!(console.say("objective 20x").await.is_err());

        assert!(console.say("show Stage").await.unwrap().contains("Position"));
        assert!(console.say("show nowhere").await.is_err());
        assert_eq!(console.say("quit").await.unwrap(), "bye");
    };

    let (reason, ()) = tokio::join!(app.run(rx, Some(reply_tx)), session);
    assert_eq!(reason.unwrap(), ExitReason::Quit);

    let stage = app.interfaces().stage.as_ref().unwrap();
    assert_eq!(stage.position_of(Axis::X).await.unwrap(), 120.0);
    // Piezo moved 7.5 and one 1 µm step.
    assert_eq!(stage.movers(Axis::Z)[1].position().await.unwrap(), 8.5);
    assert_eq!(app.interfaces().objectives.current(), "60x");
    assert!(app.depot().handler("488").unwrap().as_handler().is_enabled());
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn imaging_and_sectioning_commands() {
    let app = scope().await;
    let (mut console, rx, reply_tx) = console();
    let mut events = app.bus().subscribe();

    let session = async {
        assert!(console.say("snap").await.unwrap_err().contains("no active cameras"));
        console.say("enable camera").await.unwrap();
        assert!(console.say("snap").await.unwrap().contains("1 camera"));
        loop {
            if events.recv().await.unwrap().is_image_from("camera") {
                break;
            }
        }

        assert!(console.say("device clarity sectioning on").await.is_err());
        assert!(console
            .say("device clarity calibrate")
            .await
            .unwrap()
            .starts_with("calibrated"));
        console.say("device clarity sectioning on").await.unwrap();
        assert!(console.say("device clarity warp").await.is_err());

        assert_eq!(console.say("video on").await.unwrap(), "video on");
        assert_eq!(console.say("video").await.unwrap(), "video off");
        console.say("quit").await.unwrap();
    };

    let (reason, ()) = tokio::join!(app.run(rx, Some(reply_tx)), session);
    assert_eq!(reason.unwrap(), ExitReason::Quit);

    let camera = app.depot().cameras().remove(0);
    assert!(camera.post_processors().contains("clarity sectioning"));
    assert_eq!(camera.image_size().await.unwrap(), (16, 32));
    app.shutdown().await.unwrap();
    assert!(!camera.post_processors().contains("clarity sectioning"));
}

#[tokio::test]
async fn experiment_without_mirror_is_refused_and_abort_is_published() {
    let app = scope().await;
    let (mut console, rx, reply_tx) = console();
    let mut events = app.bus().subscribe();

    let session = async {
        // No mirror configured.
        assert!(console.say("experiment").await.is_err());
        console.say("abort").await.unwrap();
        console.say("quit").await.unwrap();
    };
    let (reason, ()) = tokio::join!(app.run(rx, Some(reply_tx)), session);
    assert_eq!(reason.unwrap(), ExitReason::Quit);

    let mut aborts = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::UserAbort) {
            aborts += 1;
        }
    }
    // One from the command, one from the loop leaving.
    assert_eq!(aborts, 2);
    app.shutdown().await.unwrap();
}
