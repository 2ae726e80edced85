//! User commands.
//!
//! Every user interaction, whether typed at the console or clicked in the
//! egui frontend, becomes a [`UiCommand`]. The [`CommandDispatcher`] executes
//! commands against the depot and the interfaces and answers with a line of
//! text for the user.
//!
//! Console grammar (names containing spaces go in double quotes):
//!
//! ```text
//! help | windows | show [window]
//! enable <handler> | disable <handler>
//! snap | video [on|off]
//! move <axis> <um> | moverel <axis> <um> | goto <x> <y> | step <axis> +|-
//! stepsize up|down|<index> | mover <index>
//! objective <name|index> | exposure <camera> <ms> | power <light> <mW>
//! device <device> <action> [value]
//! experiment [key=value ...] | abort | quit
//! ```

use super::model::{Control, Widget};
use super::{build_windows, IMAGER_TARGET, STAGE_TARGET};
use crate::depot::Depot;
use crate::error::{AppResult, CockpitError};
use crate::events::{Event, EventBus};
use crate::experiment::{BiasDatasetConfig, BiasDatasetExperiment};
use crate::handlers::stage::Axis;
use crate::handlers::Handler;
use crate::interfaces::Interfaces;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Help shown by the `help` command.
pub const HELP: &str = "\
commands:
  help                          this text
  windows                       list windows
  show [window]                 print a window (all when omitted)
  enable <handler>              enable a handler
  disable <handler>             disable a handler
  snap                          take one image with every active camera
  video [on|off]                toggle or set video mode
  move <axis> <um>              absolute move
  moverel <axis> <um>           relative move
  goto <x> <y>                  XY move
  step <axis> +|-               move one step
  stepsize up|down|<index>      change the step size
  mover <index>                 select the positioner to drive
  objective <name|index>        change objective
  exposure <camera> <ms>        set exposure time
  power <light> <mW>            set light power
  device <device> <action> [v]  device specific action
  experiment [key=value ...]    run the bias dataset experiment
  abort                         abort the running experiment
  quit                          leave";

/// Step size change.
#[derive(Debug, Clone, PartialEq)]
pub enum StepChange {
    /// Next larger size
    Up,
    /// Next smaller size
    Down,
    /// Size by index
    Index(usize),
}

/// One user command.
#[derive(Debug, Clone, PartialEq)]
pub enum UiCommand {
    /// Print the command list
    Help,
    /// List window titles
    Windows,
    /// Print one window or all of them
    Show(Option<String>),
    /// Enable or disable a handler
    Enable {
        /// Handler name
        handler: String,
        /// Target state
        enabled: bool,
    },
    /// Take one image
    TakeImage,
    /// Set (`Some`) or toggle (`None`) video mode
    Video(Option<bool>),
    /// Absolute move of one axis
    Move {
        /// Axis
        axis: Axis,
        /// Target (µm)
        position: f64,
    },
    /// Relative move of one axis
    MoveRelative {
        /// Axis
        axis: Axis,
        /// Distance (µm)
        delta: f64,
    },
    /// XY move
    GoToXY {
        /// X target (µm)
        x: f64,
        /// Y target (µm)
        y: f64,
    },
    /// One step along an axis
    Step {
        /// Axis
        axis: Axis,
        /// +1 or -1
        direction: i8,
    },
    /// Change the step size
    StepSize(StepChange),
    /// Select the positioner to drive
    Mover(usize),
    /// Change objective, by name or index
    Objective(String),
    /// Set a camera's exposure
    Exposure {
        /// Camera handler
        camera: String,
        /// Exposure (ms)
        ms: f64,
    },
    /// Set a light's power
    Power {
        /// Light handler
        light: String,
        /// Power (mW)
        mw: f64,
    },
    /// Device-specific action
    Device {
        /// Device name
        device: String,
        /// Action name
        action: String,
        /// Optional argument
        value: Option<String>,
    },
    /// Start the bias dataset experiment
    RunExperiment(BiasDatasetConfig),
    /// Abort the running experiment
    Abort,
    /// Leave the event loop
    Quit,
}

fn gui_error(message: impl Into<String>) -> CockpitError {
    CockpitError::Gui(message.into())
}

/// Split a line into words; double quotes group words containing spaces.
pub fn tokenize(line: &str) -> AppResult<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_word = false;
    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_word = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if in_quotes {
        return Err(gui_error("unterminated quote"));
    }
    if has_word {
        words.push(current);
    }
    Ok(words)
}

fn parse_number(word: &str, what: &str) -> AppResult<f64> {
    word.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| gui_error(format!("invalid {} '{}'", what, word)))
}

fn parse_axis(word: &str) -> AppResult<Axis> {
    word.parse::<Axis>().map_err(gui_error)
}

fn parse_on_off(word: &str) -> AppResult<bool> {
    match word.to_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(gui_error(format!("expected on/off, got '{}'", other))),
    }
}

fn parse_modes(value: &str) -> AppResult<Vec<usize>> {
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| gui_error(format!("invalid mode '{}'", s)))
        })
        .collect()
}

fn parse_experiment(args: &[String]) -> AppResult<BiasDatasetConfig> {
    let mut config = BiasDatasetConfig::default();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| gui_error(format!("expected key=value, got '{}'", arg)))?;
        let count = || {
            value
                .parse::<usize>()
                .map_err(|_| gui_error(format!("invalid {} '{}'", key, value)))
        };
        match key {
            "bias_modes" => config.bias_modes = parse_modes(value)?,
            "applied_modes" => config.applied_modes = parse_modes(value)?,
            "magnitude" => config.magnitude = parse_number(value, key)?,
            "steps" => config.steps = count()?,
            "areas" => config.areas = count()?,
            "prefix" => config.save_prefix = value.to_string(),
            "ao" => config.ao = value.to_string(),
            "camera" => config.camera = Some(value.to_string()),
            other => return Err(gui_error(format!("unknown experiment parameter '{}'", other))),
        }
    }
    Ok(config)
}

/// Parse one console line. Blank lines give `None`.
pub fn parse_command(line: &str) -> AppResult<Option<UiCommand>> {
    let words = tokenize(line)?;
    let Some((verb, args)) = words.split_first() else {
        return Ok(None);
    };
    let arity = |n: usize| -> AppResult<()> {
        if args.len() == n {
            Ok(())
        } else {
            Err(gui_error(format!(
                "'{}' takes {} argument(s), got {}",
                verb,
                n,
                args.len()
            )))
        }
    };

    let command = match verb.to_lowercase().as_str() {
        "help" | "?" => UiCommand::Help,
        "windows" => UiCommand::Windows,
        "show" => UiCommand::Show(args.first().cloned()),
        "enable" | "disable" => {
            arity(1)?;
            UiCommand::Enable {
                handler: args[0].clone(),
                enabled: verb.eq_ignore_ascii_case("enable"),
            }
        }
        "snap" => UiCommand::TakeImage,
        "video" => UiCommand::Video(args.first().map(|a| parse_on_off(a)).transpose()?),
        "move" => {
            arity(2)?;
            UiCommand::Move {
                axis: parse_axis(&args[0])?,
                position: parse_number(&args[1], "position")?,
            }
        }
        "moverel" => {
            arity(2)?;
            UiCommand::MoveRelative {
                axis: parse_axis(&args[0])?,
                delta: parse_number(&args[1], "distance")?,
            }
        }
        "goto" => {
            arity(2)?;
            UiCommand::GoToXY {
                x: parse_number(&args[0], "x")?,
                y: parse_number(&args[1], "y")?,
            }
        }
        "step" => {
            arity(2)?;
            let direction = match args[1].as_str() {
                "+" => 1,
                "-" => -1,
                other => return Err(gui_error(format!("step direction must be + or -, got '{}'", other))),
            };
            UiCommand::Step {
                axis: parse_axis(&args[0])?,
                direction,
            }
        }
        "stepsize" => {
            arity(1)?;
            UiCommand::StepSize(match args[0].as_str() {
                "up" => StepChange::Up,
                "down" => StepChange::Down,
                other => StepChange::Index(
                    other
                        .parse()
                        .map_err(|_| gui_error(format!("invalid step size '{}'", other)))?,
                ),
            })
        }
        "mover" => {
            arity(1)?;
            UiCommand::Mover(
                args[0]
                    .parse()
                    .map_err(|_| gui_error(format!("invalid mover '{}'", args[0])))?,
            )
        }
        "objective" => {
            arity(1)?;
            UiCommand::Objective(args[0].clone())
        }
        "exposure" => {
            arity(2)?;
            UiCommand::Exposure {
                camera: args[0].clone(),
                ms: parse_number(&args[1], "exposure")?,
            }
        }
        "power" => {
            arity(2)?;
            UiCommand::Power {
                light: args[0].clone(),
                mw: parse_number(&args[1], "power")?,
            }
        }
        "device" => {
            if args.len() < 2 || args.len() > 3 {
                return Err(gui_error("usage: device <device> <action> [value]"));
            }
            UiCommand::Device {
                device: args[0].clone(),
                action: args[1].clone(),
                value: args.get(2).cloned(),
            }
        }
        "experiment" => UiCommand::RunExperiment(parse_experiment(args)?),
        "abort" => UiCommand::Abort,
        "quit" | "exit" => UiCommand::Quit,
        other => return Err(gui_error(format!("unknown command '{}' (try 'help')", other))),
    };
    Ok(Some(command))
}

/// Text form of a widget value.
fn widget_value(widget: &Widget) -> Option<String> {
    match widget {
        Widget::Toggle { on } => Some(if *on { "on" } else { "off" }.to_string()),
        Widget::Choice { selected, .. } => Some(selected.to_string()),
        Widget::Number { value, .. } => Some(value.to_string()),
        Widget::Button | Widget::Readout { .. } => None,
    }
}

impl UiCommand {
    /// Command for a control after the user changed it to `widget`.
    ///
    /// `widget` carries the new value, e.g. the toggled state or the chosen
    /// index.
    pub fn from_control(control: &Control, widget: &Widget) -> AppResult<UiCommand> {
        let value = widget_value(widget);
        let required = || value.clone().ok_or_else(|| gui_error(format!("'{}' needs a value", control.id)));
        let target = control.target.clone();

        let command = match (control.target.as_str(), control.id.as_str()) {
            (IMAGER_TARGET, "take_image") => UiCommand::TakeImage,
            (IMAGER_TARGET, "video") => UiCommand::Video(Some(parse_on_off(&required()?)?)),
            (STAGE_TARGET, "mover") => UiCommand::Mover(
                required()?
                    .parse()
                    .map_err(|_| gui_error("invalid mover"))?,
            ),
            (STAGE_TARGET, "step_size") => UiCommand::StepSize(StepChange::Index(
                required()?
                    .parse()
                    .map_err(|_| gui_error("invalid step size"))?,
            )),
            (STAGE_TARGET, id) if id.starts_with("step_") => {
                let rest = &id["step_".len()..];
                let (axis, sign) = rest.split_at(rest.len().saturating_sub(1));
                UiCommand::Step {
                    axis: parse_axis(axis)?,
                    direction: if sign == "-" { -1 } else { 1 },
                }
            }
            (_, "enable") => UiCommand::Enable {
                handler: target,
                enabled: parse_on_off(&required()?)?,
            },
            (_, "power") => UiCommand::Power {
                light: target,
                mw: parse_number(&required()?, "power")?,
            },
            (_, "objective") => UiCommand::Objective(required()?),
            (_, "exposure") => UiCommand::Exposure {
                camera: target,
                ms: parse_number(&required()?, "exposure")?,
            },
            (_, action) => UiCommand::Device {
                device: target,
                action: action.to_string(),
                value,
            },
        };
        Ok(command)
    }
}

struct RunningExperiment {
    experiment: Arc<BiasDatasetExperiment>,
    task: JoinHandle<()>,
}

/// Executes commands against the running application.
pub struct CommandDispatcher {
    title: String,
    depot: Arc<Depot>,
    interfaces: Arc<Interfaces>,
    data_dir: PathBuf,
    bus: EventBus,
    experiment: Mutex<Option<RunningExperiment>>,
}

impl CommandDispatcher {
    /// Dispatcher writing experiment data to `data_dir`.
    pub fn new(
        title: impl Into<String>,
        depot: Arc<Depot>,
        interfaces: Arc<Interfaces>,
        data_dir: PathBuf,
    ) -> Self {
        let bus = depot.bus().clone();
        Self {
            title: title.into(),
            depot,
            interfaces,
            data_dir,
            bus,
            experiment: Mutex::new(None),
        }
    }

    fn stage(&self) -> AppResult<&crate::interfaces::StageMover> {
        self.interfaces
            .stage
            .as_deref()
            .ok_or_else(|| CockpitError::HandlerNotFound("stage".into()))
    }

    /// Execute one command and describe the result.
    pub async fn dispatch(&self, command: UiCommand) -> AppResult<String> {
        tracing::debug!(?command, "dispatch");
        match command {
            UiCommand::Help => Ok(HELP.to_string()),
            UiCommand::Windows => {
                let windows = build_windows(&self.title, &self.depot, &self.interfaces).await;
                Ok(windows
                    .iter()
                    .map(|w| format!("{} ({:?})", w.title, w.kind))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            UiCommand::Show(name) => {
                let windows = build_windows(&self.title, &self.depot, &self.interfaces).await;
                let shown: Vec<String> = windows
                    .iter()
                    .filter(|w| name.as_deref().map_or(true, |n| w.title.eq_ignore_ascii_case(n)))
                    .map(|w| w.render_text())
                    .collect();
                if shown.is_empty() {
                    return Err(gui_error(format!(
                        "no window '{}'",
                        name.unwrap_or_default()
                    )));
                }
                Ok(shown.join("\n"))
            }
            UiCommand::Enable { handler, enabled } => {
                let state = self
                    .depot
                    .handler(&handler)?
                    .as_handler()
                    .set_enabled(enabled)
                    .await?;
                Ok(format!("{}: {}", handler, state))
            }
            UiCommand::TakeImage => {
                let n = self.interfaces.imager.take_image().await?;
                Ok(format!("triggered {} camera(s)", n))
            }
            UiCommand::Video(wanted) => {
                let imager = &self.interfaces.imager;
                let running = match wanted {
                    None => imager.toggle_video().await?,
                    Some(true) => {
                        imager.start_video().await?;
                        true
                    }
                    Some(false) => {
                        imager.stop_video().await;
                        false
                    }
                };
                Ok(format!("video {}", if running { "on" } else { "off" }))
            }
            UiCommand::Move { axis, position } => {
                let at = self.stage()?.go_to(axis, position).await?;
                Ok(format!("{} at {:.2} µm", axis, at))
            }
            UiCommand::MoveRelative { axis, delta } => {
                let at = self.stage()?.move_relative(axis, delta).await?;
                Ok(format!("{} at {:.2} µm", axis, at))
            }
            UiCommand::GoToXY { x, y } => {
                self.stage()?.go_to_xy(x, y).await?;
                Ok(format!("at ({:.2}, {:.2}) µm", x, y))
            }
            UiCommand::Step { axis, direction } => {
                let at = self.stage()?.step(axis, direction).await?;
                Ok(format!("{} at {:.2} µm", axis, at))
            }
            UiCommand::StepSize(change) => {
                let stage = self.stage()?;
                let size = match change {
                    StepChange::Up => stage.change_step_size(true),
                    StepChange::Down => stage.change_step_size(false),
                    StepChange::Index(i) => stage.set_step_size_index(i)?,
                };
                Ok(format!("step size {} µm", size))
            }
            UiCommand::Mover(index) => {
                self.stage()?.set_current_mover(index)?;
                Ok(format!("driving mover {}", index))
            }
            UiCommand::Objective(name) => {
                let objectives = &self.interfaces.objectives;
                let name = match name.parse::<usize>() {
                    Ok(i) => objectives
                        .names()
                        .get(i)
                        .cloned()
                        .ok_or_else(|| gui_error(format!("no objective {}", i)))?,
                    Err(_) => name,
                };
                objectives.change(&name)?;
                Ok(format!(
                    "objective {} ({} µm/px)",
                    name,
                    objectives.pixel_size()
                ))
            }
            UiCommand::Exposure { camera, ms } => {
                let handler = self
                    .depot
                    .handler(&camera)?
                    .as_camera()
                    .ok_or_else(|| gui_error(format!("'{}' is not a camera", camera)))?;
                handler.set_exposure_time_ms(ms).await?;
                Ok(format!("{} exposure {} ms", camera, ms))
            }
            UiCommand::Power { light, mw } => {
                let handler = self
                    .depot
                    .handler(&light)?
                    .as_light_source()
                    .ok_or_else(|| gui_error(format!("'{}' is not a light source", light)))?;
                handler.set_power_mw(mw).await?;
                Ok(format!("{} power {} mW", light, mw))
            }
            UiCommand::Device {
                device,
                action,
                value,
            } => self
                .depot
                .device(&device)?
                .invoke(&action, value.as_deref())
                .await
                .map_err(|e| CockpitError::device(&device, e)),
            UiCommand::RunExperiment(config) => self.start_experiment(config).await,
            UiCommand::Abort => {
                self.bus.publish(Event::UserAbort);
                match self.experiment.lock().await.as_ref() {
                    Some(running) if !running.task.is_finished() => {
                        running.experiment.abort();
                        Ok("aborting experiment".into())
                    }
                    _ => Ok("nothing to abort".into()),
                }
            }
            UiCommand::Quit => Ok("bye".into()),
        }
    }

    async fn start_experiment(&self, config: BiasDatasetConfig) -> AppResult<String> {
        let mut slot = self.experiment.lock().await;
        if slot.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(CockpitError::ExperimentRunning);
        }
        let experiment = Arc::new(BiasDatasetExperiment::new(
            config,
            Arc::clone(&self.depot),
            &self.interfaces,
            self.data_dir.clone(),
        )?);
        let reps = experiment.rep_count();
        let runner = Arc::clone(&experiment);
        let task = tokio::spawn(async move {
            match runner.run().await {
                Ok(record) => tracing::info!(
                    state = %record.state,
                    reps = record.reps_done,
                    files = record.files.len(),
                    "experiment finished"
                ),
                Err(e) => tracing::error!(error = %e, "experiment failed"),
            }
        });
        *slot = Some(RunningExperiment { experiment, task });
        Ok(format!(
            "experiment started: {} reps into {}",
            reps,
            self.data_dir.display()
        ))
    }

    /// Wait for a running experiment to end.
    pub async fn wait_for_experiment(&self) {
        let running = self.experiment.lock().await.take();
        if let Some(running) = running {
            if let Err(e) = running.task.await {
                tracing::warn!(error = %e, "experiment task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_keeps_quoted_names() {
        assert_eq!(
            tokenize(r#"enable "stage x""#).unwrap(),
            vec!["enable", "stage x"]
        );
        assert!(tokenize(r#"enable "stage"#).is_err());
        assert!(tokenize("   ").unwrap().is_empty());
    }

    #[test]
    fn parses_console_commands() {
        assert_eq!(parse_command("").unwrap(), None);
        assert_eq!(
            parse_command("move z 12.5").unwrap(),
            Some(UiCommand::Move {
                axis: Axis::Z,
                position: 12.5
            })
        );
        assert_eq!(
            parse_command("step x -").unwrap(),
            Some(UiCommand::Step {
                axis: Axis::X,
                direction: -1
            })
        );
        assert_eq!(
            parse_command("device clarity sectioning on").unwrap(),
            Some(UiCommand::Device {
                device: "clarity".into(),
                action: "sectioning".into(),
                value: Some("on".into())
            })
        );
        assert_eq!(parse_command("video").unwrap(), Some(UiCommand::Video(None)));
        assert_eq!(parse_command("QUIT").unwrap(), Some(UiCommand::Quit));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_command("fly away").is_err());
        assert!(parse_command("move w 1").is_err());
        assert!(parse_command("move x").is_err());
        assert!(parse_command("power 488 lots").is_err());
        assert!(parse_command("experiment areas").is_err());
    }

    #[test]
    fn experiment_parameters_override_defaults() {
        let Some(UiCommand::RunExperiment(config)) =
            parse_command("experiment areas=2 steps=3 bias_modes=4,5 prefix=T_").unwrap()
        else {
            panic!("expected experiment command");
        };
        assert_eq!(config.areas, 2);
        assert_eq!(config.steps, 3);
        assert_eq!(config.bias_modes, vec![4, 5]);
        assert_eq!(config.save_prefix, "T_");
        assert_eq!(config.ao, "ao");
    }

    #[test]
    fn controls_map_to_commands() {
        let toggle = Control::new("488", "enable", "488", Widget::Toggle { on: false });
        assert_eq!(
            UiCommand::from_control(&toggle, &Widget::Toggle { on: true }).unwrap(),
            UiCommand::Enable {
                handler: "488".into(),
                enabled: true
            }
        );

        let step = Control::new(STAGE_TARGET, "step_y-", "Y -", Widget::Button);
        assert_eq!(
            UiCommand::from_control(&step, &Widget::Button).unwrap(),
            UiCommand::Step {
                axis: Axis::Y,
                direction: -1
            }
        );

        let choice = Control::new(
            "clarity",
            "disk",
            "Sectioning",
            Widget::Choice {
                options: vec!["LOW".into(), "MID".into()],
                selected: 0,
            },
        );
        let picked = Widget::Choice {
            options: vec!["LOW".into(), "MID".into()],
            selected: 1,
        };
        assert_eq!(
            UiCommand::from_control(&choice, &picked).unwrap(),
            UiCommand::Device {
                device: "clarity".into(),
                action: "disk".into(),
                value: Some("1".into())
            }
        );
    }
}
