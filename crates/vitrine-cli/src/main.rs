use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use vitrine_contracts::chat::{parse_intent, STUDIO_HELP_COMMANDS};
use vitrine_contracts::error::GenerationError;
use vitrine_contracts::events::EventLog;
use vitrine_contracts::model::{
    AccessoryItem, AccessoryKind, Finger, GenerationSettings, LightingEffect, RemoveExisting,
    Side, SubjectPhoto, MAX_ITEMS,
};
use vitrine_contracts::models::{ModelSelector, EDIT_CAPABILITY};
use vitrine_contracts::prompt::compose_initial_prompt;
use vitrine_contracts::response::Interpretation;
use vitrine_contracts::session::{loading_message, user_message, Operation, Phase, SessionState};
use vitrine_engine::{
    client_for_model, data_uri_from_path, load_image, load_subject, write_result_image,
    GeminiConfig, GenerationAdapter,
};

#[derive(Debug, Parser)]
#[command(name = "vitrine", version, about = "Virtual accessory try-on")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the composed generation prompt without calling a model.
    Prompt(PromptArgs),
    Generate(GenerateArgs),
    Refine(RefineArgs),
    /// Generate, then refine interactively.
    Studio(GenerateArgs),
}

#[derive(Debug, Args)]
struct ItemArgs {
    #[arg(long)]
    subject: PathBuf,
    /// `category=ring,image=ring.png,finger=ring,scale=1.2`; repeatable.
    #[arg(long = "item", required = true)]
    items: Vec<String>,
    #[arg(long, default_value = "auto")]
    remove_existing: String,
    #[arg(long, default_value = "none")]
    lighting: String,
}

#[derive(Debug, Args)]
struct ModelArgs {
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value_t = 90.0)]
    timeout: f64,
    #[arg(long, default_value_t = 0)]
    retries: usize,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct PromptArgs {
    #[command(flatten)]
    items: ItemArgs,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[command(flatten)]
    items: ItemArgs,
    #[command(flatten)]
    model: ModelArgs,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct RefineArgs {
    #[arg(long)]
    subject: PathBuf,
    #[arg(long)]
    previous: PathBuf,
    #[arg(long)]
    instruction: String,
    #[command(flatten)]
    model: ModelArgs,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct ItemSpec {
    kind: AccessoryKind,
    image: Option<PathBuf>,
    scale: f64,
}

const PROGRESS_INTERVAL: Duration = Duration::from_millis(2500);
const EXIT_GENERATION_FAILED: i32 = 2;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("vitrine error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Prompt(args) => run_prompt(args),
        Command::Generate(args) => run_generate(args),
        Command::Refine(args) => run_refine(args),
        Command::Studio(args) => run_studio(args),
    }
}

fn run_prompt(args: PromptArgs) -> Result<i32> {
    let (subject, items, settings) = load_inputs(&args.items, false)?;
    println!("{}", compose_initial_prompt(&subject, &items, &settings));
    Ok(0)
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let (subject, items, settings) = load_inputs(&args.items, true)?;
    let adapter = build_adapter(&args.model, &args.out, items.len() + 1)?;
    let outcome = adapter.generate(Some(&subject), &items, &settings);
    finish_single(Operation::Generate, outcome, &args.out, args.json)
}

fn run_refine(args: RefineArgs) -> Result<i32> {
    let subject = load_subject(&args.subject)?;
    let previous = data_uri_from_path(&args.previous)?;
    let adapter = build_adapter(&args.model, &args.out, 2)?;
    let outcome = adapter.refine(Some(&subject), Some(&previous), &args.instruction);
    finish_single(Operation::Refine, outcome, &args.out, args.json)
}

fn finish_single(
    operation: Operation,
    outcome: Result<Interpretation, GenerationError>,
    out: &Path,
    as_json: bool,
) -> Result<i32> {
    let interpretation = match outcome {
        Ok(interpretation) => interpretation,
        Err(err) => {
            if as_json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "ok": false,
                        "kind": err.kind(),
                        "message": user_message(operation, &err),
                    }))?
                );
            } else {
                eprintln!("vitrine: {}", user_message(operation, &err));
            }
            return Ok(EXIT_GENERATION_FAILED);
        }
    };

    write_result_image(out, &interpretation)?;
    let warning = interpretation.semantic_issue();
    if as_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "ok": true,
                "image_path": out.display().to_string(),
                "media_type": interpretation.image.media_type,
                "result": interpretation.result,
                "warning": warning,
            }))?
        );
    } else {
        println!("Saved {}", out.display());
        print_result_summary(&interpretation);
        if let Some(warning) = warning {
            eprintln!("vitrine warning: {warning}");
        }
    }
    Ok(0)
}

fn run_studio(args: GenerateArgs) -> Result<i32> {
    let (subject, items, mut settings) = load_inputs(&args.items, true)?;
    let adapter = Arc::new(build_adapter(&args.model, &args.out, items.len() + 1)?);
    let subject = Arc::new(subject);
    let items = Arc::new(items);
    let deadline = wait_deadline(&args.model);
    let mut state = SessionState::new();

    println!(
        "Vitrine studio ({}). Type an instruction to refine, /help for commands.",
        adapter.model()
    );
    state = studio_generate(&state, &adapter, &subject, &items, settings, deadline);
    report_outcome(&state, &args.out)?;

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let intent = parse_intent(line.trim_end_matches(['\n', '\r']));
        match intent.action.as_str() {
            "noop" => continue,
            "quit" => break,
            "help" => {
                println!("Commands: {}", STUDIO_HELP_COMMANDS.join(" "));
                println!("Any other text is sent as a refinement instruction.");
            }
            "refine" => {
                let Some(instruction) = intent.instruction.clone() else {
                    println!("/refine requires an instruction");
                    continue;
                };
                let Some(prior) = state.result.as_ref().map(Interpretation::image_data_uri)
                else {
                    state = state.reject("There is no result to refine yet. Try /regenerate.");
                    report_outcome(&state, &args.out)?;
                    continue;
                };
                state = studio_refine(&state, &adapter, &subject, prior, instruction, deadline);
                report_outcome(&state, &args.out)?;
            }
            "regenerate" => {
                state = studio_generate(&state, &adapter, &subject, &items, settings, deadline);
                report_outcome(&state, &args.out)?;
            }
            "set_setting" => {
                apply_setting_update(&mut settings, &intent.settings_update);
            }
            "save" => {
                let Some(path) = value_as_non_empty_string(intent.command_args.get("path")) else {
                    println!("/save requires a path");
                    continue;
                };
                match state.result.as_ref() {
                    Some(result) => {
                        write_result_image(Path::new(&path), result)?;
                        println!("Saved {path}");
                    }
                    None => println!("Nothing to save yet."),
                }
            }
            "status" => print_status(&state, &settings),
            "show_prompt" => {
                println!("{}", compose_initial_prompt(&subject, &items, &settings));
            }
            "unknown" => {
                let command = value_as_non_empty_string(intent.command_args.get("command"))
                    .unwrap_or_else(|| "unknown".to_string());
                println!("Unknown command: /{command}");
            }
            other => println!("Unhandled action: {other}"),
        }
    }

    Ok(match state.phase {
        Phase::Error => EXIT_GENERATION_FAILED,
        _ => 0,
    })
}

fn studio_generate(
    state: &SessionState,
    adapter: &Arc<GenerationAdapter>,
    subject: &Arc<SubjectPhoto>,
    items: &Arc<Vec<AccessoryItem>>,
    settings: GenerationSettings,
    deadline: Duration,
) -> SessionState {
    let adapter = Arc::clone(adapter);
    let subject = Arc::clone(subject);
    let items = Arc::clone(items);
    let (next, ticket) = state.start_submit();
    let (outcome, waited) = wait_for_worker(deadline, move || {
        adapter.generate(Some(&subject), &items, &settings)
    });
    eprintln!("  ({:.1}s)", waited.as_secs_f64());
    next.complete(ticket, outcome)
}

fn studio_refine(
    state: &SessionState,
    adapter: &Arc<GenerationAdapter>,
    subject: &Arc<SubjectPhoto>,
    prior: String,
    instruction: String,
    deadline: Duration,
) -> SessionState {
    let adapter = Arc::clone(adapter);
    let subject = Arc::clone(subject);
    let (next, ticket) = state.start_refine();
    let (outcome, waited) = wait_for_worker(deadline, move || {
        adapter.refine(Some(&subject), Some(&prior), &instruction)
    });
    eprintln!("  ({:.1}s)", waited.as_secs_f64());
    next.complete(ticket, outcome)
}

/// Runs `job` on a worker thread, printing progress lines until it answers or
/// `deadline` passes. A late answer is dropped with the channel.
fn wait_for_worker<F>(
    deadline: Duration,
    job: F,
) -> (Result<Interpretation, GenerationError>, Duration)
where
    F: FnOnce() -> Result<Interpretation, GenerationError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(job());
    });

    let started = Instant::now();
    let mut tick = 0usize;
    eprintln!("  {}", loading_message(tick));
    loop {
        match rx.recv_timeout(PROGRESS_INTERVAL) {
            Ok(outcome) => return (outcome, started.elapsed()),
            Err(RecvTimeoutError::Timeout) => {
                if started.elapsed() >= deadline {
                    let message = format!(
                        "no response after {:.0}s",
                        started.elapsed().as_secs_f64()
                    );
                    return (Err(GenerationError::Upstream(message)), started.elapsed());
                }
                tick += 1;
                eprintln!("  {}", loading_message(tick));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return (
                    Err(GenerationError::Upstream(
                        "generation worker exited without a result".to_string(),
                    )),
                    started.elapsed(),
                );
            }
        }
    }
}

fn wait_deadline(args: &ModelArgs) -> Duration {
    let per_attempt = GeminiConfig::default()
        .with_timeout_seconds(args.timeout)
        .timeout;
    per_attempt * (args.retries.min(4) as u32 + 1) + Duration::from_secs(10)
}

fn report_outcome(state: &SessionState, out: &Path) -> Result<()> {
    match state.phase {
        Phase::Success => {
            if let Some(result) = state.result.as_ref() {
                write_result_image(out, result)?;
                println!("Saved {}", out.display());
                print_result_summary(result);
            }
            if let Some(warning) = state.warning.as_deref() {
                println!("Warning: {warning}");
            }
        }
        Phase::Error => {
            let message = state.error.as_deref().unwrap_or("Unknown error.");
            println!("Error: {message}");
            if state.result.is_some() {
                println!("The previous result is kept.");
            }
        }
        Phase::Idle | Phase::Submitting | Phase::Refining => {}
    }
    Ok(())
}

fn print_result_summary(result: &Interpretation) {
    let Some(report) = result.result.as_ref() else {
        println!("(no JSON report from the model)");
        return;
    };
    if !report.summary.trim().is_empty() {
        println!("Summary: {}", report.summary.trim());
    }
    for placement in &report.placements {
        println!(
            "  item {} ({}) confidence {:.2}",
            placement.item_index, placement.category, placement.confidence
        );
    }
}

fn print_status(state: &SessionState, settings: &GenerationSettings) {
    println!("Phase: {:?}", state.phase);
    println!(
        "Settings: remove_existing={} lighting={}",
        settings.remove_existing_jewelry.as_str(),
        settings.lighting_effect.as_str()
    );
    match state.result.as_ref() {
        Some(result) => {
            println!("Result: {}", result.image.media_type);
            match result.result.as_ref() {
                Some(report) => {
                    println!("Status: {}", report.status.as_str());
                    print_result_summary(result);
                    if !report.debug_notes.trim().is_empty() {
                        println!("Notes: {}", report.debug_notes.trim());
                    }
                }
                None => println!("Status: (no report)"),
            }
        }
        None => println!("Result: none"),
    }
    if let Some(warning) = state.warning.as_deref() {
        println!("Warning: {warning}");
    }
    if let Some(error) = state.error.as_deref() {
        println!("Last error: {error}");
    }
}

fn apply_setting_update(
    settings: &mut GenerationSettings,
    update: &std::collections::BTreeMap<String, Value>,
) {
    if let Some(raw) = update.get("lighting_effect") {
        let raw = raw.as_str().unwrap_or_default();
        match LightingEffect::parse(raw) {
            Some(effect) => {
                settings.lighting_effect = effect;
                println!("Lighting set to {}", effect.as_str());
            }
            None => println!(
                "Unknown lighting '{raw}'. Options: {}",
                LightingEffect::ALL
                    .iter()
                    .map(|effect| effect.as_str())
                    .collect::<Vec<&str>>()
                    .join(", ")
            ),
        }
    }
    if let Some(raw) = update.get("remove_existing_jewelry") {
        let raw = raw.as_str().unwrap_or_default();
        match RemoveExisting::parse(raw) {
            Some(mode) => {
                settings.remove_existing_jewelry = mode;
                println!("Remove existing jewelry set to {}", mode.as_str());
            }
            None => println!("Unknown value '{raw}'. Options: auto, yes, no"),
        }
    }
}

fn build_adapter(args: &ModelArgs, out: &Path, input_images: usize) -> Result<GenerationAdapter> {
    let selector = ModelSelector::new(None);
    let selection = selector
        .select(args.model.as_deref(), EDIT_CAPABILITY, input_images)
        .map_err(|err| anyhow!(err))?;
    if selection.requested.is_some() {
        if let Some(reason) = selection.fallback_reason.as_deref() {
            eprintln!("vitrine: {reason} Using {}.", selection.model.name);
        }
    }

    let config = GeminiConfig::from_env()
        .with_timeout_seconds(args.timeout)
        .with_transport_retries(args.retries);
    let client = client_for_model(&selection.model, config)?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| default_events_path(out));
    let events = EventLog::new(events_path, format!("vitrine-{}", compact_timestamp()));
    Ok(GenerationAdapter::new(client, selection.model.name.clone()).with_events(events))
}

fn default_events_path(out: &Path) -> PathBuf {
    match out.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join("events.jsonl"),
        _ => PathBuf::from("events.jsonl"),
    }
}

fn load_inputs(
    args: &ItemArgs,
    require_images: bool,
) -> Result<(SubjectPhoto, Vec<AccessoryItem>, GenerationSettings)> {
    if args.items.len() > MAX_ITEMS {
        bail!("at most {MAX_ITEMS} --item values are supported");
    }
    let subject = load_subject(&args.subject)?;
    let settings = parse_settings(&args.remove_existing, &args.lighting)?;

    let mut items = Vec::with_capacity(args.items.len());
    for (idx, raw) in args.items.iter().enumerate() {
        let spec = parse_item_spec(raw).with_context(|| format!("invalid --item '{raw}'"))?;
        let mut item = AccessoryItem::new(idx as u64 + 1, spec.kind).with_scale(spec.scale);
        match spec.image {
            Some(path) => item = item.with_image(load_image(&path)?),
            None if require_images => bail!("--item '{raw}' needs image=PATH"),
            None => {}
        }
        items.push(item);
    }
    Ok((subject, items, settings))
}

fn parse_settings(remove_existing: &str, lighting: &str) -> Result<GenerationSettings> {
    let remove_existing_jewelry = RemoveExisting::parse(remove_existing)
        .with_context(|| format!("unknown --remove-existing value '{remove_existing}'"))?;
    let lighting_effect = LightingEffect::parse(lighting)
        .with_context(|| format!("unknown --lighting value '{lighting}'"))?;
    Ok(GenerationSettings {
        remove_existing_jewelry,
        lighting_effect,
    })
}

fn parse_item_spec(raw: &str) -> Result<ItemSpec> {
    let mut category: Option<String> = None;
    let mut image: Option<PathBuf> = None;
    let mut scale = 1.0;
    let mut placements: Vec<(String, String)> = Vec::new();

    for field in raw.split(',').map(str::trim).filter(|field| !field.is_empty()) {
        let Some((key, value)) = field.split_once('=') else {
            bail!("expected key=value, got '{field}'");
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "category" => category = Some(value.to_string()),
            "image" => image = Some(PathBuf::from(value)),
            "scale" => {
                scale = value
                    .parse::<f64>()
                    .ok()
                    .filter(|parsed| parsed.is_finite())
                    .with_context(|| format!("scale '{value}' is not a number"))?;
            }
            "finger" | "wrist" | "side" | "hand" => {
                placements.push((key.to_string(), value.to_string()));
            }
            other => bail!("unknown item key '{other}'"),
        }
    }

    let Some(category) = category.filter(|value| !value.is_empty()) else {
        bail!("category is required");
    };
    let mut kind = AccessoryKind::from_category(&category);
    for (key, value) in placements {
        kind = with_placement(kind, &key, &value)?;
    }
    Ok(ItemSpec { kind, image, scale })
}

fn with_placement(kind: AccessoryKind, key: &str, value: &str) -> Result<AccessoryKind> {
    let side = || Side::parse(value).with_context(|| format!("{key} must be left or right"));
    Ok(match (kind, key) {
        (AccessoryKind::Ring { .. }, "finger") => AccessoryKind::Ring {
            finger: Some(Finger::parse(value).with_context(|| {
                format!("unknown finger '{value}' (thumb, index, middle, ring, pinky)")
            })?),
        },
        (AccessoryKind::Bracelet { .. }, "wrist") => AccessoryKind::Bracelet {
            wrist: Some(side()?),
        },
        (AccessoryKind::Earring { .. }, "side") => AccessoryKind::Earring {
            side: Some(side()?),
        },
        (AccessoryKind::Handbag { .. }, "hand") => AccessoryKind::Handbag {
            hand: Some(side()?),
        },
        (kind, key) => bail!("'{key}' does not apply to a {kind} item"),
    })
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    let raw = value
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

fn compact_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use serde_json::Value;
    use vitrine_contracts::error::GenerationError;
    use vitrine_contracts::model::{
        AccessoryKind, Finger, GenerationSettings, LightingEffect, RemoveExisting, Side,
    };

    use super::{
        apply_setting_update, default_events_path, parse_item_spec, parse_settings,
        wait_for_worker, wait_deadline, ModelArgs,
    };

    #[test]
    fn item_spec_parses_category_fields() {
        let spec = parse_item_spec("category=ring, image=rings/gold.png, finger=index, scale=1.2")
            .unwrap();
        assert_eq!(
            spec.kind,
            AccessoryKind::Ring {
                finger: Some(Finger::Index)
            }
        );
        assert_eq!(spec.image, Some(PathBuf::from("rings/gold.png")));
        assert_eq!(spec.scale, 1.2);

        let spec = parse_item_spec("category=handbag,hand=left").unwrap();
        assert_eq!(
            spec.kind,
            AccessoryKind::Handbag {
                hand: Some(Side::Left)
            }
        );
        assert_eq!(spec.scale, 1.0);
        assert!(spec.image.is_none());
    }

    #[test]
    fn item_spec_keeps_unknown_categories() {
        let spec = parse_item_spec("category=brooch,image=b.png").unwrap();
        assert_eq!(spec.kind, AccessoryKind::Other("brooch".to_string()));
    }

    #[test]
    fn item_spec_rejects_bad_input() {
        assert!(parse_item_spec("image=a.png").is_err());
        assert!(parse_item_spec("category=necklace,finger=ring").is_err());
        assert!(parse_item_spec("category=ring,finger=toe").is_err());
        assert!(parse_item_spec("category=earring,side=up").is_err());
        assert!(parse_item_spec("category=hat,scale=big").is_err());
        assert!(parse_item_spec("category=hat,color=red").is_err());
        assert!(parse_item_spec("category=hat,oops").is_err());
    }

    #[test]
    fn settings_flags_parse() {
        let settings = parse_settings("yes", "studio").unwrap();
        assert_eq!(settings.remove_existing_jewelry, RemoveExisting::Yes);
        assert_eq!(settings.lighting_effect, LightingEffect::Studio);
        assert!(parse_settings("maybe", "none").is_err());
        assert!(parse_settings("auto", "neon").is_err());
    }

    #[test]
    fn studio_setting_updates_apply_valid_values_only() {
        let mut settings = GenerationSettings::default();
        let mut update = BTreeMap::new();
        update.insert(
            "lighting_effect".to_string(),
            Value::String("warm".to_string()),
        );
        update.insert(
            "remove_existing_jewelry".to_string(),
            Value::String("sometimes".to_string()),
        );
        apply_setting_update(&mut settings, &update);
        assert_eq!(settings.lighting_effect, LightingEffect::Warm);
        assert_eq!(settings.remove_existing_jewelry, RemoveExisting::Auto);
    }

    #[test]
    fn events_default_next_to_output() {
        assert_eq!(
            default_events_path(Path::new("out/look.png")),
            PathBuf::from("out/events.jsonl")
        );
        assert_eq!(
            default_events_path(Path::new("look.png")),
            PathBuf::from("events.jsonl")
        );
    }

    #[test]
    fn worker_deadline_reports_upstream_timeout() {
        let (outcome, _) = wait_for_worker(Duration::from_millis(1), || {
            std::thread::sleep(Duration::from_secs(4));
            Err(GenerationError::NoImageReturned)
        });
        match outcome {
            Err(GenerationError::Upstream(message)) => assert!(message.contains("no response")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn worker_outcome_is_returned() {
        let (outcome, _) = wait_for_worker(Duration::from_secs(30), || {
            Err(GenerationError::NoImageReturned)
        });
        assert_eq!(outcome, Err(GenerationError::NoImageReturned));
    }

    #[test]
    fn wait_deadline_covers_every_attempt() {
        let args = ModelArgs {
            model: None,
            timeout: 20.0,
            retries: 1,
            events: None,
        };
        assert_eq!(wait_deadline(&args), Duration::from_secs(50));
    }
}
