use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use eframe::egui;
use log::{error, info, warn};
use viewport_sft::action::{
    HOTKEY_PRESETS, MouseButton, SPECIAL_KEYS, ScrollDirection, WAIT_PRESETS,
};
use viewport_sft::evaluate::{CommandEvaluator, Evaluator, NullEvaluator};
use viewport_sft::session::{InputFocus, PointerMode, SessionTask};
use viewport_sft::task::{TaskEntry, load_tasks, task_queue};
use viewport_sft::{
    HttpVm, Point, RawEvent, RecorderConfig, Session, SessionError, Size, StepOutcome,
};

const HUD_HEIGHT: f32 = 40.0;
const SCROLL_CLICKS: u32 = 3;

const ACCENT: egui::Color32 = egui::Color32::from_rgb(100, 149, 237);
const WARN: egui::Color32 = egui::Color32::from_rgb(240, 180, 60);
const DANGER: egui::Color32 = egui::Color32::from_rgb(230, 80, 80);

#[derive(Parser, Debug)]
#[command(name = "viewport-sft", about = "Record operator trajectories against a VM")]
struct Args {
    /// JSON map of domain to task names
    #[arg(long)]
    task_file: PathBuf,
    /// Directory holding examples/<domain>/<task>.json
    #[arg(long, default_value = "evaluation_examples")]
    test_config_base_dir: PathBuf,
    #[arg(long)]
    domain: Option<String>,
    /// Record only this task (name, id or <domain>/<name>); by default every
    /// listed task is recorded in turn
    #[arg(long)]
    task: Option<String>,
    #[arg(long)]
    result_dir: Option<PathBuf>,
    #[arg(long)]
    vm_host: Option<String>,
    #[arg(long)]
    vm_port: Option<u16>,
    #[arg(long)]
    screen_width: Option<u32>,
    #[arg(long)]
    screen_height: Option<u32>,
    /// Config file; defaults to <config_dir>/viewport-sft/config.json
    #[arg(long)]
    config: Option<PathBuf>,
    /// Evaluation command, called as `<cmd> <task_id> <task_dir>`
    #[arg(long)]
    eval_cmd: Option<String>,
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Print the resolved tasks and exit
    #[arg(long)]
    list: bool,
}

impl Args {
    fn apply(&self, config: &mut RecorderConfig) {
        if let Some(host) = &self.vm_host {
            config.vm_host = host.clone();
        }
        if let Some(port) = self.vm_port {
            config.vm_port = port;
        }
        if let Some(dir) = &self.result_dir {
            config.result_dir = dir.clone();
        }
        if let Some(w) = self.screen_width {
            config.screen_width = w;
        }
        if let Some(h) = self.screen_height {
            config.screen_height = h;
        }
        if let Some(cmd) = &self.eval_cmd {
            config.evaluate_command = Some(cmd.clone());
        }
    }
}

type OperatorSession = Session<HttpVm, Box<dyn Evaluator>>;

#[derive(Default)]
struct OverlayInputs {
    text: String,
    hotkey: usize,
    key: usize,
    wait: usize,
}

struct RecorderApp {
    session: OperatorSession,
    texture: Option<egui::TextureHandle>,
    texture_generation: u64,
    overlay: OverlayInputs,
    status: String,
    closing: bool,
}

impl RecorderApp {
    fn new(cc: &eframe::CreationContext<'_>, session: OperatorSession) -> Self {
        cc.egui_ctx.set_visuals(egui::Visuals::dark());
        // One egui point per VM pixel.
        cc.egui_ctx.set_pixels_per_point(1.0);

        Self {
            session,
            texture: None,
            texture_generation: 0,
            overlay: OverlayInputs::default(),
            status: "Ready".into(),
            closing: false,
        }
    }

    fn apply(&mut self, result: Result<StepOutcome, SessionError>) {
        self.status = match result {
            Ok(StepOutcome::Recorded { index, action }) => {
                format!("Step {index}: {}", action.command())
            }
            Ok(StepOutcome::Refreshed) => "Screenshot refreshed".into(),
            Ok(StepOutcome::Ignored) => return,
            Ok(StepOutcome::Failed { index, error }) => {
                format!("Step {index} failed: {error}")
            }
            Ok(StepOutcome::Finished(report)) => {
                format!("Saved to {} (score {})", report.task_dir.display(), report.score)
            }
            Ok(StepOutcome::Aborted { reason, finalize }) => match finalize {
                Ok(report) => format!("Aborted ({reason}); saved to {}", report.task_dir.display()),
                Err(e) => format!("Aborted ({reason}); save failed: {e}"),
            },
            Err(e) => {
                error!("{e}");
                format!("Error: {e}")
            }
        };
    }

    fn send(&mut self, event: RawEvent) {
        let result = self.session.handle(event);
        self.apply(result);
    }

    fn handle_keys(&mut self, ctx: &egui::Context) {
        let typing = ctx.wants_keyboard_input();
        let (finish, escape, space) = ctx.input(|i| {
            (
                i.key_pressed(egui::Key::F12),
                i.key_pressed(egui::Key::Escape),
                i.key_pressed(egui::Key::Space),
            )
        });

        if finish {
            self.send(RawEvent::Finish);
        } else if escape {
            if self.session.focus() == InputFocus::Overlay {
                self.session.set_focus(InputFocus::Viewport);
            } else if self.session.pointer_mode() != PointerMode::Click {
                self.send(RawEvent::ToggleDrag);
                self.status = "Drag cancelled".into();
            } else {
                self.send(RawEvent::Abort);
            }
        } else if space && !typing {
            self.send(RawEvent::ToggleOverlay);
        }
    }

    fn sync_texture(&mut self, ctx: &egui::Context) {
        let generation = self.session.frame_generation();
        if generation == self.texture_generation {
            return;
        }
        let Some(shot) = self.session.current_frame() else {
            return;
        };
        let image = egui::ColorImage::from_rgba_unmultiplied(
            [shot.width() as usize, shot.height() as usize],
            shot.as_raw(),
        );
        match &mut self.texture {
            Some(texture) => texture.set(image, egui::TextureOptions::NEAREST),
            None => {
                self.texture =
                    Some(ctx.load_texture("vm-frame", image, egui::TextureOptions::NEAREST));
            }
        }
        self.texture_generation = generation;
    }

    fn render_hud(&mut self, ctx: &egui::Context) {
        let mut pending = None;

        egui::TopBottomPanel::top("hud")
            .exact_height(HUD_HEIGHT)
            .frame(egui::Frame::new().fill(egui::Color32::from_rgb(18, 18, 24)).inner_margin(8.0))
            .show(ctx, |ui| {
                ui.horizontal_centered(|ui| {
                    let steps = self.session.recorder().len();
                    ui.label(egui::RichText::new(format!("STEP {steps}")).strong().color(ACCENT));
                    ui.separator();

                    let pan = self.session.viewport().pan_offset();
                    ui.label(format!("pan {},{}", pan.x, pan.y));
                    ui.separator();

                    match self.session.pointer_mode() {
                        PointerMode::Click => {}
                        PointerMode::DragStart => {
                            ui.label(egui::RichText::new("DRAG: pick start").color(WARN));
                        }
                        PointerMode::DragEnd { .. } => {
                            ui.label(egui::RichText::new("DRAG: pick end").color(WARN));
                        }
                    }

                    if let Some(failed) = self.session.failed_step() {
                        ui.label(
                            egui::RichText::new(format!("step {} failed", failed.index))
                                .color(DANGER),
                        );
                        if ui.button("Retry").clicked() {
                            pending = Some(HudCommand::Retry);
                        }
                        if ui.button("Skip").clicked() {
                            pending = Some(HudCommand::Skip);
                        }
                    } else {
                        ui.label(egui::RichText::new(&self.status).color(egui::Color32::GRAY));
                    }

                    if self.session.state().is_terminal() && self.session.report().is_none() {
                        if ui.button("Save again").clicked() {
                            pending = Some(HudCommand::SaveAgain);
                        }
                    }

                    ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                        ui.label(
                            egui::RichText::new("SPACE controls | F12 finish | ESC exit")
                                .color(egui::Color32::DARK_GRAY),
                        );
                    });
                });
            });

        match pending {
            Some(HudCommand::Retry) => {
                let result = self.session.retry();
                self.apply(result);
            }
            Some(HudCommand::Skip) => {
                let result = self.session.skip();
                self.apply(result);
            }
            Some(HudCommand::SaveAgain) => match self.session.finalize_again() {
                Ok(report) => self.status = format!("Saved to {}", report.task_dir.display()),
                Err(e) => self.status = format!("Save failed: {e}"),
            },
            None => {}
        }
    }

    fn render_overlay(&mut self, ctx: &egui::Context) {
        if self.session.focus() != InputFocus::Overlay {
            return;
        }
        let mut events = Vec::new();
        let mut open = true;

        egui::Window::new("Controls")
            .open(&mut open)
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                ui.label(egui::RichText::new(&self.session.task().instruction).italics());
                ui.add_space(8.0);

                ui.horizontal(|ui| {
                    let edit = ui.add(
                        egui::TextEdit::singleline(&mut self.overlay.text)
                            .hint_text("Text to type")
                            .desired_width(260.0),
                    );
                    let submit =
                        edit.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));
                    if (ui.button("Type").clicked() || submit) && !self.overlay.text.is_empty() {
                        events.push(RawEvent::TypeText(std::mem::take(&mut self.overlay.text)));
                    }
                });

                ui.horizontal(|ui| {
                    egui::ComboBox::from_id_salt("hotkey")
                        .width(180.0)
                        .selected_text(HOTKEY_PRESETS[self.overlay.hotkey].0)
                        .show_index(ui, &mut self.overlay.hotkey, HOTKEY_PRESETS.len(), |i| {
                            HOTKEY_PRESETS[i].0
                        });
                    if ui.button("Send hotkey").clicked() {
                        let keys = HOTKEY_PRESETS[self.overlay.hotkey].1;
                        events.push(RawEvent::Hotkey(keys.iter().map(|k| k.to_string()).collect()));
                    }
                });

                ui.horizontal(|ui| {
                    egui::ComboBox::from_id_salt("key")
                        .width(180.0)
                        .selected_text(SPECIAL_KEYS[self.overlay.key])
                        .show_index(ui, &mut self.overlay.key, SPECIAL_KEYS.len(), |i| {
                            SPECIAL_KEYS[i]
                        });
                    if ui.button("Press key").clicked() {
                        events.push(RawEvent::Key(SPECIAL_KEYS[self.overlay.key].to_string()));
                    }
                });

                ui.horizontal(|ui| {
                    egui::ComboBox::from_id_salt("wait")
                        .width(180.0)
                        .selected_text(format!("{}s", WAIT_PRESETS[self.overlay.wait]))
                        .show_index(ui, &mut self.overlay.wait, WAIT_PRESETS.len(), |i| {
                            format!("{}s", WAIT_PRESETS[i])
                        });
                    if ui.button("Wait").clicked() {
                        events.push(RawEvent::Wait(WAIT_PRESETS[self.overlay.wait]));
                    }
                });

                ui.add_space(8.0);
                ui.horizontal(|ui| {
                    if ui.button("Scroll up").clicked() {
                        events.push(RawEvent::Scroll {
                            direction: ScrollDirection::Up,
                            amount: SCROLL_CLICKS,
                        });
                    }
                    if ui.button("Scroll down").clicked() {
                        events.push(RawEvent::Scroll {
                            direction: ScrollDirection::Down,
                            amount: SCROLL_CLICKS,
                        });
                    }
                    if ui.button("Refresh").clicked() {
                        events.push(RawEvent::Refresh);
                    }
                });

                let drag_label = match self.session.pointer_mode() {
                    PointerMode::Click => "Drag mode",
                    _ => "Cancel drag",
                };
                if ui.button(drag_label).clicked() {
                    events.push(RawEvent::ToggleDrag);
                }

                ui.add_space(8.0);
                let finish = egui::Button::new(egui::RichText::new("Finish task").strong())
                    .fill(ACCENT)
                    .min_size(egui::vec2(ui.available_width(), 32.0));
                if ui.add(finish).clicked() {
                    events.push(RawEvent::Finish);
                }
            });

        if !open {
            self.session.set_focus(InputFocus::Viewport);
        }
        if !events.is_empty() {
            // Back to the VM once something was chosen.
            self.session.set_focus(InputFocus::Viewport);
        }
        for event in events {
            self.send(event);
        }
    }

    fn render_viewport(&mut self, ui: &mut egui::Ui, dt: f32) {
        let rect = ui.max_rect();
        let response = ui.allocate_rect(rect, egui::Sense::click());
        self.session.resize(Size::new(
            rect.width().max(1.0) as u32,
            rect.height().max(1.0) as u32,
        ));

        let to_window = |pos: egui::Pos2| {
            let rel = pos - rect.min;
            Point::new(rel.x as i32, rel.y as i32)
        };
        let hover = response.hover_pos();
        self.session.tick(hover.map(to_window), dt);
        self.sync_texture(ui.ctx());

        let state = *self.session.viewport().state();
        let painter = ui.painter_at(rect);
        if let Some(texture) = &self.texture {
            let frame = state.vm_frame_size;
            let visible = state.visible_size();
            let (fw, fh) = (frame.width as f32, frame.height as f32);
            let pan = state.pan_offset;
            let uv = egui::Rect::from_min_max(
                egui::pos2(pan.x as f32 / fw, pan.y as f32 / fh),
                egui::pos2(
                    (pan.x as f32 + visible.width as f32) / fw,
                    (pan.y as f32 + visible.height as f32) / fh,
                ),
            );
            let dest = egui::Rect::from_min_size(
                rect.min,
                egui::vec2(visible.width as f32, visible.height as f32),
            );
            painter.image(texture.id(), dest, uv, egui::Color32::WHITE);
        }

        if let PointerMode::DragEnd { start } = self.session.pointer_mode() {
            let p = self.session.viewport().to_window(start);
            let at = rect.min + egui::vec2(p.x as f32, p.y as f32);
            painter.circle_stroke(at, 6.0, egui::Stroke::new(2.0, WARN));
        }

        if let Some(pos) = hover {
            let stroke = egui::Stroke::new(1.0, ACCENT);
            painter.line_segment([pos - egui::vec2(10.0, 0.0), pos + egui::vec2(10.0, 0.0)], stroke);
            painter.line_segment([pos - egui::vec2(0.0, 10.0), pos + egui::vec2(0.0, 10.0)], stroke);
        }

        let mut minimap = None;
        if let Some(map) = self.session.viewport().minimap() {
            let frame = state.vm_frame_size;
            let scale = 160.0 / frame.width as f32;
            let size = egui::vec2(160.0, frame.height as f32 * scale);
            let outer = egui::Rect::from_min_size(
                rect.right_bottom() - size - egui::vec2(12.0, 12.0),
                size,
            );
            painter.rect_filled(outer, 2.0, egui::Color32::from_black_alpha(180));
            let inner = egui::Rect::from_min_size(
                outer.min + egui::vec2(map.x * size.x, map.y * size.y),
                egui::vec2(map.width * size.x, map.height * size.y),
            );
            painter.rect_stroke(inner, 0.0, egui::Stroke::new(1.5, ACCENT), egui::StrokeKind::Inside);
            minimap = Some((outer, scale));
        }

        if self.session.focus() != InputFocus::Viewport {
            return;
        }
        let button = if response.clicked() {
            Some(MouseButton::Left)
        } else if response.secondary_clicked() {
            Some(MouseButton::Right)
        } else if response.middle_clicked() {
            Some(MouseButton::Middle)
        } else {
            None
        };
        let Some(pos) = response.interact_pointer_pos() else {
            return;
        };
        if let (Some(MouseButton::Left), Some((outer, scale))) = (button, minimap) {
            if outer.contains(pos) {
                // Centre the view on the clicked spot instead of clicking the VM.
                let visible = state.visible_size();
                let at = (pos - outer.min) / scale;
                self.session.pan_to(Point::new(
                    at.x as i32 - visible.width as i32 / 2,
                    at.y as i32 - visible.height as i32 / 2,
                ));
                return;
            }
        }
        if let Some(button) = button {
            self.send(RawEvent::PointerClick {
                position: to_window(pos),
                button,
            });
        }
    }
}

enum HudCommand {
    Retry,
    Skip,
    SaveAgain,
}

impl eframe::App for RecorderApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let dt = ctx.input(|i| i.stable_dt).min(0.1);

        if ctx.input(|i| i.viewport().close_requested()) && !self.session.state().is_terminal() {
            let outcome = self.session.abort("window closed");
            self.apply(Ok(outcome));
        }

        self.handle_keys(ctx);
        self.render_hud(ctx);
        self.render_overlay(ctx);

        egui::CentralPanel::default()
            .frame(egui::Frame::new().fill(egui::Color32::BLACK))
            .show(ctx, |ui| self.render_viewport(ui, dt));

        if self.session.state().is_terminal() && self.session.report().is_some() && !self.closing {
            info!("{}", self.status);
            self.closing = true;
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }

        // Edge panning needs a steady frame clock.
        ctx.request_repaint();
    }
}

/// Opens the operator window for one task and blocks until it closes.
/// Returns `false` when the session could not be started.
fn record_task(config: &RecorderConfig, entry: &TaskEntry) -> Result<bool> {
    let vm = HttpVm::connect(&config.vm_host, config.vm_port, config.request_timeout())
        .context("creating VM client")?;
    info!("VM control server at {}", vm.base_url());

    let evaluator: Box<dyn Evaluator> = match config
        .evaluate_command
        .as_deref()
        .and_then(CommandEvaluator::from_command_line)
    {
        Some(cmd) => Box::new(cmd),
        None => Box::new(NullEvaluator),
    };

    let screen = config.screen_size();
    let task = SessionTask {
        task_id: entry.identifier(),
        instruction: entry.config.instruction.clone(),
    };
    let mut session = Session::new(
        vm,
        evaluator,
        task,
        config.result_dir.clone(),
        screen,
        config.session_options(),
    );
    if let Err(e) = session.start() {
        error!("could not start session for {}: {e}", entry.identifier());
        return Ok(false);
    }

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(format!("Viewport SFT - {}", entry.identifier()))
            .with_inner_size([screen.width as f32, screen.height as f32 + HUD_HEIGHT])
            .with_min_inner_size([640.0, 480.0])
            .with_maximized(true),
        // Return after the window closes so the next task can open its own.
        run_and_return: true,
        ..Default::default()
    };

    eframe::run_native(
        "Viewport SFT Recorder",
        native_options,
        Box::new(move |cc| Ok(Box::new(RecorderApp::new(cc, session)))),
    )
    .map_err(|e| anyhow::anyhow!("window failed: {e}"))?;
    Ok(true)
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = RecorderConfig::load(args.config.as_deref())?;
    config.apply_env()?;
    args.apply(&mut config);
    config.validate()?;

    let log_file = viewport_sft::logging::init(&args.log_level, &config.result_dir)
        .with_context(|| format!("creating run log under {}", config.result_dir.display()))?;
    info!("run log: {}", log_file.display());

    let tasks = load_tasks(&args.task_file, &args.test_config_base_dir, args.domain.as_deref())
        .with_context(|| format!("loading tasks from {}", args.task_file.display()))?;
    if args.list {
        for t in &tasks {
            println!("{}\t{}\t{}", t.identifier(), t.config.id, t.config.instruction);
        }
        return Ok(());
    }

    let queue = task_queue(tasks, args.task.as_deref())?;
    let total = queue.len();
    let mut recorded = 0;
    for (n, entry) in queue.iter().enumerate() {
        info!(
            "task {}/{total} {}: {}",
            n + 1,
            entry.identifier(),
            entry.config.instruction
        );
        if record_task(&config, entry)? {
            recorded += 1;
        } else {
            warn!("skipping {}", entry.identifier());
        }
    }

    info!(
        "recorded {recorded}/{total} tasks into {}",
        config.result_dir.display()
    );
    if recorded == 0 {
        bail!("no task could be recorded");
    }
    Ok(())
}
