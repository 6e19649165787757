use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, ValueEnum, error::ErrorKind};
use directories::ProjectDirs;
use once_cell::sync::{Lazy, OnceCell};
use ort::{
    inputs,
    session::{
        Session,
        builder::{GraphOptimizationLevel, SessionBuilder},
    },
    value::Tensor,
};
use regex::Regex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use zip::ZipArchive;

/// Hugging Face repo fetched when neither `--repo-id` nor `--model-dir` is
/// given. It publishes `config.json`, an ONNX graph and a `.npz` voice table.
const DEFAULT_REPO_ID: &str = "KittenML/kitten-tts-nano-0.8-fp32";
const DEFAULT_SPEAKER: &str = "Henriette Usha";
const DEFAULT_SAMPLE_RATE: u32 = 24_000;
const DEFAULT_MAX_CHARS: usize = 400;
#[cfg(feature = "cuda")]
const DEFAULT_CUDA_DEVICE_ID: i32 = 0;
const SESSION_THREADS: usize = 1;
const MAX_INPUT_TOKENS: usize = 510;
const MAX_TOTAL_INPUT_CHARS: usize = 20_000;
const MAX_SYNTHESIS_CHUNKS: usize = 256;
const MAX_CHARS_HARD_LIMIT: usize = 2_000;
const MIN_SPEED: f32 = 0.5;
const MAX_SPEED: f32 = 2.0;
const TOKEN_PAD_ID: i64 = 0;
const MAX_NPY_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const TEXT_PREVIEW_CHARS: usize = 50;
const HUB_BASE_URL: &str = "https://huggingface.co";
const HUB_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HUB_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[cfg(target_os = "windows")]
const ORT_LIBRARY_NAME: &str = "onnxruntime.dll";
#[cfg(any(target_os = "macos", target_os = "ios"))]
const ORT_LIBRARY_NAME: &str = "libonnxruntime.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "ios")))]
const ORT_LIBRARY_NAME: &str = "libonnxruntime.so";

/// Languages the bundled multilingual models are known to handle.
const SUPPORTED_LANGUAGES: [&str; 16] = [
    "en", "es", "fr", "de", "it", "pt", "pl", "tr", "ru", "nl", "cs", "ar", "zh-cn", "ja", "ko",
    "hi",
];

// Token vocabulary of the acoustic graphs, in id order starting at the pad.
const SYMBOL_PAD: char = '$';
const SYMBOL_PUNCTUATION: &str = ";:,.!?¡¿—…\"«»\"\" ";
const SYMBOL_LETTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const SYMBOL_IPA: &str = "ɑɐɒæɓʙβɔɕçɗɖðʤəɘɚɛɜɝɞɟʄɡɠɢʛɦɧħɥʜɨɪʝɭɬɫɮʟɱɯɰŋɳɲɴøɵɸθœɶʘɹɺɾɻʀʁɽʂʃʈʧʉʊʋⱱʌɣɤʍχʎʏʑʐʒʔʡʕʢǀǁǂǃˈˌːˑʼʴʰʱʲʷˠˤ˞↓↑→↗↘'̩'ᵻ";

static TOKEN_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+|[^\w\s]").expect("valid regex"));
static SENTENCE_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?。！？]+").expect("valid regex"));
static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static NPY_DESCR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"['"]descr['"]\s*:\s*['"]([^'"]*)['"]"#).expect("valid regex")
});
static NPY_FORTRAN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"['"]fortran_order['"]\s*:\s*(True|False)"#).expect("valid regex")
});
static NPY_SHAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"['"]shape['"]\s*:\s*\(([^)]*)\)"#).expect("valid regex"));
static ORT_INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, Parser)]
#[command(name = "polyglot-tts", version)]
#[command(about = "Write speech for a text string using a pretrained multilingual TTS model")]
struct Cli {
    /// Text to synthesize; may itself start with '-'
    #[arg(allow_hyphen_values = true)]
    text: String,
    /// Destination WAV file
    output_path: PathBuf,
    /// Language code, e.g. en, fr, zh-cn
    language_code: String,
    #[arg(
        long,
        help = "Speaker id or alias. If omitted, use the model's default speaker"
    )]
    speaker: Option<String>,
    #[command(flatten)]
    model: ModelSelection,
    #[arg(long, value_enum, default_value_t = PhonemizerMode::Auto)]
    phonemizer: PhonemizerMode,
    #[arg(long, default_value_t = 1.0)]
    speed: f32,
    #[arg(long, default_value_t = DEFAULT_MAX_CHARS)]
    max_chars: usize,
    #[arg(
        long,
        help = "Samples dropped from the end of each chunk (overrides config.json)"
    )]
    trim_tail: Option<usize>,
    #[arg(long, value_enum, default_value_t = WavEncoding::Pcm16)]
    wav_encoding: WavEncoding,
}

#[derive(Debug, Clone, Default, Args)]
struct ModelSelection {
    #[arg(long, conflicts_with = "model_dir")]
    repo_id: Option<String>,
    #[arg(
        long,
        help = "Load the model from a local directory containing config.json"
    )]
    model_dir: Option<PathBuf>,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    #[arg(long, help = "Download model files again even when cached")]
    force_download: bool,
    #[arg(
        long,
        help = "Path to libonnxruntime shared library for dynamic loading"
    )]
    ort_lib: Option<PathBuf>,
    #[arg(long, help = "Run inference on the CUDA execution provider")]
    gpu: bool,
}

#[derive(Debug, Clone, Default)]
struct OrtRuntimeConfig {
    ort_lib: Option<PathBuf>,
    gpu: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WavEncoding {
    Pcm16,
    Float32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PhonemizerMode {
    Auto,
    EspeakNg,
    Espeak,
}

impl PhonemizerMode {
    fn programs(self) -> &'static [&'static str] {
        match self {
            Self::Auto => &["espeak-ng", "espeak"],
            Self::EspeakNg => &["espeak-ng"],
            Self::Espeak => &["espeak"],
        }
    }
}

impl ModelSelection {
    fn resolve_repo_id(&self) -> String {
        self.repo_id
            .clone()
            .unwrap_or_else(|| DEFAULT_REPO_ID.to_string())
    }

    fn display_name(&self) -> String {
        match &self.model_dir {
            Some(dir) => dir.display().to_string(),
            None => self.resolve_repo_id(),
        }
    }

    fn resolve_cache_dir(&self) -> Result<PathBuf> {
        if let Some(cache_dir) = &self.cache_dir {
            return Ok(cache_dir.clone());
        }
        let dirs = ProjectDirs::from("io", "polyglot-tts", "polyglot-tts")
            .ok_or_else(|| anyhow!("could not determine platform cache directory"))?;
        Ok(dirs.cache_dir().to_path_buf())
    }

    fn resolve_ort_runtime_config(&self) -> OrtRuntimeConfig {
        OrtRuntimeConfig {
            ort_lib: self.ort_lib.clone(),
            gpu: self.gpu,
        }
    }
}

fn is_supported_language(code: &str) -> bool {
    SUPPORTED_LANGUAGES.contains(&code)
}

/// Maps a language code onto the espeak voice used for phonemization.
/// Unknown codes pass through so espeak can decide.
fn espeak_voice(code: &str) -> &str {
    match code {
        "en" => "en-us",
        "fr" => "fr-fr",
        "zh-cn" => "cmn",
        other => other,
    }
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

/// `config.json` published next to the graph. KittenML repos name the
/// speaker table `voices` and the aliases `voice_aliases`; both spellings
/// are accepted.
#[derive(Debug, Deserialize)]
struct ModelConfig {
    #[serde(rename = "type")]
    model_type: String,
    model_file: String,
    #[serde(alias = "voices")]
    speakers: String,
    #[serde(default = "default_sample_rate")]
    sample_rate: u32,
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    default_speaker: Option<String>,
    #[serde(default, alias = "voice_aliases")]
    speaker_aliases: HashMap<String, String>,
    #[serde(default)]
    speed_priors: HashMap<String, f32>,
    #[serde(default)]
    trim_tail: usize,
}

impl ModelConfig {
    fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading config at {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed parsing config at {}", path.display()))
    }

    fn parse(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        if config.model_type != "ONNX1" && config.model_type != "ONNX2" {
            bail!(
                "unsupported model type '{}': expected ONNX1 or ONNX2",
                config.model_type
            );
        }
        if config.sample_rate == 0 {
            bail!("model sample_rate must be non-zero");
        }
        Ok(config)
    }

    /// Index of `code` in the model's declared languages, fed to the graph
    /// as `language_id`. `None` when the model declares no languages.
    fn language_id(&self, code: &str) -> Result<Option<i64>> {
        if self.languages.is_empty() {
            return Ok(None);
        }
        match self.languages.iter().position(|lang| lang == code) {
            Some(index) => Ok(Some(index as i64)),
            None => bail!(
                "language '{code}' is not supported by model (declared: {:?})",
                self.languages
            ),
        }
    }
}

#[derive(Debug, Serialize)]
struct CacheManifest {
    repo_id: String,
    fetched_at_unix: u64,
    model_file: String,
    speakers_file: String,
}

#[derive(Debug)]
struct ModelArtifacts {
    name: String,
    model_dir: PathBuf,
    model_path: PathBuf,
    speakers_path: PathBuf,
    config: ModelConfig,
}

/// Parsed `.npy` header dictionary.
#[derive(Debug, PartialEq)]
struct NpyHeader {
    descr: String,
    fortran_order: bool,
    shape: Vec<usize>,
}

impl NpyHeader {
    fn parse(text: &str) -> Result<Self> {
        let descr = header_capture(&NPY_DESCR_RE, text, "descr")?.to_string();
        let fortran_order = header_capture(&NPY_FORTRAN_RE, text, "fortran_order")? == "True";
        let shape = header_capture(&NPY_SHAPE_RE, text, "shape")?
            .split(',')
            .map(str::trim)
            .filter(|dim| !dim.is_empty())
            .map(|dim| {
                dim.parse::<usize>()
                    .with_context(|| format!("invalid npy shape dimension '{dim}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            descr,
            fortran_order,
            shape,
        })
    }
}

fn header_capture<'a>(re: &Regex, text: &'a str, field: &str) -> Result<&'a str> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| anyhow!("npy header missing '{field}' field"))
}

#[derive(Debug)]
struct SpeakerEmbedding {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl SpeakerEmbedding {
    /// Decodes a little-endian f32 `.npy` array of one or two dimensions.
    fn from_npy(bytes: &[u8]) -> Result<Self> {
        let rest = bytes
            .strip_prefix(NPY_MAGIC)
            .ok_or_else(|| anyhow!("invalid npy magic header"))?;
        let (header_len, rest) = match rest {
            [1, _, a, b, rest @ ..] => (u16::from_le_bytes([*a, *b]) as usize, rest),
            [2 | 3, _, a, b, c, d, rest @ ..] => {
                (u32::from_le_bytes([*a, *b, *c, *d]) as usize, rest)
            }
            [1 | 2 | 3, ..] | [] => bail!("npy payload too small"),
            [version, ..] => bail!("unsupported npy version {version}"),
        };
        if rest.len() < header_len {
            bail!("npy header length exceeds payload size");
        }
        let (header, payload) = rest.split_at(header_len);
        let header = NpyHeader::parse(
            std::str::from_utf8(header).context("npy header is not valid utf-8")?,
        )?;

        if header.descr != "<f4" {
            bail!("unsupported npy dtype '{}', expected '<f4'", header.descr);
        }
        if header.fortran_order {
            bail!("fortran-ordered npy arrays are not supported");
        }
        let (rows, cols) = match header.shape[..] {
            [cols] => (1, cols),
            [rows, cols] => (rows, cols),
            _ => bail!(
                "expected 1D or 2D speaker embedding shape, got {:?}",
                header.shape
            ),
        };

        let expected_bytes = rows
            .checked_mul(cols)
            .and_then(|items| items.checked_mul(size_of::<f32>()))
            .ok_or_else(|| anyhow!("npy shape overflow for {rows}x{cols} f32 values"))?;
        if payload.len() != expected_bytes {
            bail!(
                "npy data size mismatch: expected {expected_bytes} bytes, got {}",
                payload.len()
            );
        }

        let data = payload
            .chunks_exact(size_of::<f32>())
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self { rows, cols, data })
    }

    fn row(&self, index: usize) -> Result<&[f32]> {
        if self.cols == 0 {
            bail!("invalid speaker embedding: zero columns");
        }
        if index >= self.rows {
            bail!("style row index out of bounds: {index} >= {}", self.rows);
        }
        let start = index * self.cols;
        Ok(&self.data[start..start + self.cols])
    }

    /// Multi-row embeddings are indexed by content token count.
    fn style_for_tokens(&self, content_tokens: usize) -> Result<&[f32]> {
        self.row(content_tokens.min(self.rows.saturating_sub(1)))
    }
}

#[derive(Debug, Default)]
struct SpeakerTable {
    speakers: BTreeMap<String, SpeakerEmbedding>,
}

impl SpeakerTable {
    fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open speaker archive: {}", path.display()))?;
        let mut archive = ZipArchive::new(file)
            .with_context(|| format!("failed to read npz archive: {}", path.display()))?;

        let mut speakers = BTreeMap::new();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let Some(speaker_id) = entry.name().strip_suffix(".npy").map(str::to_string) else {
                continue;
            };

            let mut raw = Vec::new();
            (&mut entry)
                .take(MAX_NPY_ENTRY_BYTES + 1)
                .read_to_end(&mut raw)?;
            if raw.len() as u64 > MAX_NPY_ENTRY_BYTES {
                bail!(
                    "speaker entry '{speaker_id}' exceeds maximum allowed size ({MAX_NPY_ENTRY_BYTES} bytes)"
                );
            }
            let embedding = SpeakerEmbedding::from_npy(&raw)
                .with_context(|| format!("failed parsing speaker entry '{speaker_id}'"))?;
            speakers.insert(speaker_id, embedding);
        }
        debug!(count = speakers.len(), path = %path.display(), "loaded speaker table");

        Ok(Self { speakers })
    }

    fn is_empty(&self) -> bool {
        self.speakers.is_empty()
    }

    fn ids(&self) -> Vec<&str> {
        self.speakers.keys().map(String::as_str).collect()
    }

    fn get(&self, speaker: &str) -> Result<&SpeakerEmbedding> {
        self.speakers
            .get(speaker)
            .ok_or_else(|| anyhow!("speaker '{speaker}' not found in speaker table"))
    }

    /// Picks the speaker to synthesize with: an explicit request (after alias
    /// lookup) must exist; otherwise the model's default, then
    /// [`DEFAULT_SPEAKER`], then the first id in the table.
    fn resolve_speaker(&self, requested: Option<&str>, config: &ModelConfig) -> Result<String> {
        if let Some(requested) = requested {
            let resolved = config
                .speaker_aliases
                .get(requested)
                .map(String::as_str)
                .unwrap_or(requested);
            if self.speakers.contains_key(resolved) {
                return Ok(resolved.to_string());
            }
            bail!("speaker '{requested}' is not available. Available: {:?}", self.ids());
        }

        let preferred = config
            .default_speaker
            .as_deref()
            .into_iter()
            .chain([DEFAULT_SPEAKER]);
        for candidate in preferred {
            if self.speakers.contains_key(candidate) {
                return Ok(candidate.to_string());
            }
        }

        let first = self
            .speakers
            .keys()
            .next()
            .ok_or_else(|| anyhow!("no speakers available in speaker table"))?;
        println!("{}", speaker_fallback_warning(first));
        Ok(first.clone())
    }
}

fn speaker_fallback_warning(fallback: &str) -> String {
    format!("Warning: Default speaker '{DEFAULT_SPEAKER}' not found in the model, using '{fallback}'")
}

/// Maps IPA phoneme characters onto the token ids the acoustic graph was
/// trained with. Characters outside the table are dropped.
#[derive(Debug)]
struct SymbolTable {
    ids: HashMap<char, i64>,
}

impl SymbolTable {
    fn ipa() -> Self {
        let symbols = std::iter::once(SYMBOL_PAD)
            .chain(SYMBOL_PUNCTUATION.chars())
            .chain(SYMBOL_LETTERS.chars())
            .chain(SYMBOL_IPA.chars());
        // A symbol listed twice keeps its later id.
        Self {
            ids: symbols.zip(0_i64..).collect(),
        }
    }

    fn id(&self, symbol: char) -> Option<i64> {
        self.ids.get(&symbol).copied()
    }

    /// Encodes espeak output piece by piece, separated by the space symbol.
    fn encode_phonemes(&self, phonemes: &str) -> Vec<i64> {
        let mut tokens = Vec::new();
        for (position, piece) in TOKEN_SPLIT_RE.find_iter(phonemes).enumerate() {
            if position > 0 {
                tokens.extend(self.id(' '));
            }
            tokens.extend(piece.as_str().chars().filter_map(|ch| self.id(ch)));
        }
        tokens
    }
}

trait Phonemizer {
    fn name(&self) -> &str;
    fn phonemize(&self, text: &str, voice: &str) -> Result<String>;
}

/// Arguments for one espeak call. The chunk itself is written to stdin, so
/// text such as `-v xx` can never be read as an option.
fn espeak_args(voice: &str) -> [&str; 5] {
    ["-q", "--ipa=3", "--stdin", "-v", voice]
}

#[derive(Debug)]
struct EspeakPhonemizer {
    name: &'static str,
    program: PathBuf,
}

impl Phonemizer for EspeakPhonemizer {
    fn name(&self) -> &str {
        self.name
    }

    fn phonemize(&self, text: &str, voice: &str) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(espeak_args(voice))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "failed to start phonemizer '{}' at {}",
                    self.name,
                    self.program.display()
                )
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            writeln!(stdin, "{text}")
                .with_context(|| format!("failed sending text to phonemizer '{}'", self.name))?;
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("phonemizer '{}' did not finish", self.name))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "phonemizer '{}' failed for voice '{voice}': {}",
                self.name,
                stderr.trim()
            );
        }

        let phonemes = String::from_utf8(output.stdout)
            .context("phonemizer emitted non-utf8 output")?
            .trim()
            .to_string();
        if phonemes.is_empty() {
            bail!("phonemizer '{}' returned empty phoneme output", self.name);
        }
        Ok(phonemes)
    }
}

fn detect_phonemizer(mode: PhonemizerMode) -> Result<EspeakPhonemizer> {
    let candidates = mode.programs();
    let phonemizer = candidates
        .iter()
        .find_map(|&name| {
            which::which(name)
                .ok()
                .map(|program| EspeakPhonemizer { name, program })
        })
        .ok_or_else(|| {
            anyhow!(
                "no espeak phonemizer found on PATH (tried: {})",
                candidates.join(", ")
            )
        })?;
    debug!(program = %phonemizer.program.display(), "using espeak phonemizer");
    Ok(phonemizer)
}

/// Graph inputs for one chunk. `input_ids` already carries both pad tokens.
#[derive(Debug, Clone, PartialEq)]
struct ChunkInputs {
    input_ids: Vec<i64>,
    style: Vec<f32>,
    speed: f32,
    language_id: Option<i64>,
}

/// Runs the acoustic graph for one chunk and returns its raw waveform.
trait AcousticModel {
    fn infer(&mut self, inputs: ChunkInputs) -> Result<Vec<f32>>;
}

struct OnnxModel {
    session: Session,
}

impl OnnxModel {
    fn load(model_path: &Path, runtime: &OrtRuntimeConfig) -> Result<Self> {
        init_ort(runtime)?;

        let mut builder = Session::builder()?
            .with_parallel_execution(false)?
            .with_intra_threads(SESSION_THREADS)?
            .with_inter_threads(SESSION_THREADS)?
            .with_intra_op_spinning(false)?
            .with_inter_op_spinning(false)?
            .with_memory_pattern(false)?
            .with_deterministic_compute(true)?;
        if runtime.gpu {
            builder = enable_gpu(builder)?;
        }

        let session = builder
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load onnx model from {}", model_path.display()))?;
        info!(model = %model_path.display(), gpu = runtime.gpu, "onnx session ready");
        Ok(Self { session })
    }
}

impl AcousticModel for OnnxModel {
    fn infer(&mut self, inputs: ChunkInputs) -> Result<Vec<f32>> {
        let ChunkInputs {
            input_ids,
            style,
            speed,
            language_id,
        } = inputs;
        let input_ids = Tensor::from_array(([1_usize, input_ids.len()], input_ids))
            .context("failed building input_ids tensor")?;
        let style = Tensor::from_array(([1_usize, style.len()], style))
            .context("failed building style tensor")?;
        let speed = Tensor::from_array(([1_usize], vec![speed]))
            .context("failed building speed tensor")?;

        let outputs = match language_id {
            Some(language_id) => {
                let language = Tensor::from_array(([1_usize], vec![language_id]))
                    .context("failed building language_id tensor")?;
                self.session.run(inputs![
                    "input_ids" => input_ids,
                    "style" => style,
                    "speed" => speed,
                    "language_id" => language
                ])?
            }
            None => self.session.run(inputs![
                "input_ids" => input_ids,
                "style" => style,
                "speed" => speed
            ])?,
        };

        if outputs.len() == 0 {
            bail!("onnx model returned no output tensors");
        }
        let (_, waveform) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("failed extracting f32 output tensor")?;
        Ok(waveform.to_vec())
    }
}

#[cfg(feature = "cuda")]
fn enable_gpu(builder: SessionBuilder) -> Result<SessionBuilder> {
    let cuda = ort::ep::CUDA::default()
        .with_device_id(DEFAULT_CUDA_DEVICE_ID)
        .build()
        .error_on_failure();
    builder
        .with_execution_providers([cuda])
        .context("failed enabling CUDA execution provider")
}

#[cfg(not(feature = "cuda"))]
fn enable_gpu(_builder: SessionBuilder) -> Result<SessionBuilder> {
    bail!("--gpu requires a build with the `cuda` feature enabled")
}

/// `--ort-lib`, then `ORT_DYLIB_PATH`, then the platform library name left
/// to the dynamic loader's search path.
fn ort_library_path(runtime: &OrtRuntimeConfig) -> PathBuf {
    runtime
        .ort_lib
        .clone()
        .or_else(|| std::env::var_os("ORT_DYLIB_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(ORT_LIBRARY_NAME))
}

fn init_ort(runtime: &OrtRuntimeConfig) -> Result<()> {
    ORT_INIT.get_or_try_init(|| -> Result<()> {
        let library = ort_library_path(runtime);
        debug!(path = %library.display(), "loading onnx runtime");
        let environment = ort::init_from(&library).with_context(|| {
            format!("failed loading ONNX Runtime from {}", library.display())
        })?;
        let _ = environment.with_name(env!("CARGO_PKG_NAME")).commit();
        Ok(())
    })?;
    Ok(())
}

/// One synthesis call: speaker, language and pacing for every chunk.
#[derive(Debug, Clone, Copy)]
struct SynthesisRequest<'a> {
    speaker_id: &'a str,
    speaker: &'a SpeakerEmbedding,
    espeak_voice: &'a str,
    language_id: Option<i64>,
    speed: f32,
    max_chars: usize,
}

struct Synthesizer<M> {
    model: M,
    symbols: SymbolTable,
    speed_priors: HashMap<String, f32>,
    trim_tail: usize,
}

impl<M: AcousticModel> Synthesizer<M> {
    fn new(model: M, speed_priors: HashMap<String, f32>, trim_tail: usize) -> Self {
        Self {
            model,
            symbols: SymbolTable::ipa(),
            speed_priors,
            trim_tail,
        }
    }

    fn synthesize(
        &mut self,
        text: &str,
        request: &SynthesisRequest<'_>,
        phonemizer: &dyn Phonemizer,
    ) -> Result<Vec<f32>> {
        if !request.speed.is_finite() || !(MIN_SPEED..=MAX_SPEED).contains(&request.speed) {
            bail!("speed must be between {MIN_SPEED} and {MAX_SPEED}");
        }
        if request.max_chars == 0 || request.max_chars > MAX_CHARS_HARD_LIMIT {
            bail!("max_chars must be between 1 and {MAX_CHARS_HARD_LIMIT}");
        }
        let text = normalize_whitespace(text);
        if text.is_empty() {
            bail!("input text is empty after whitespace normalization");
        }
        let text_chars = text.chars().count();
        if text_chars > MAX_TOTAL_INPUT_CHARS {
            bail!("input text too long ({text_chars} chars, max {MAX_TOTAL_INPUT_CHARS})");
        }

        let chunks = chunk_text(&text, request.max_chars);
        if chunks.is_empty() {
            bail!("input text produced zero chunks");
        }
        if chunks.len() > MAX_SYNTHESIS_CHUNKS {
            bail!(
                "input produced too many chunks ({}, max {MAX_SYNTHESIS_CHUNKS})",
                chunks.len()
            );
        }
        debug!(chunks = chunks.len(), "split input text");

        let mut waveform = Vec::new();
        for chunk in &chunks {
            waveform.extend(self.synthesize_chunk(chunk, request, phonemizer)?);
        }
        if waveform.is_empty() {
            bail!("model produced no audio samples");
        }
        Ok(waveform)
    }

    fn synthesize_chunk(
        &mut self,
        chunk: &str,
        request: &SynthesisRequest<'_>,
        phonemizer: &dyn Phonemizer,
    ) -> Result<Vec<f32>> {
        let phonemes = phonemizer
            .phonemize(chunk, request.espeak_voice)
            .with_context(|| {
                format!("failed phonemizing chunk with '{}': {chunk}", phonemizer.name())
            })?;
        let content = self.symbols.encode_phonemes(&phonemes);
        if content.is_empty() {
            bail!("tokenizer produced empty token sequence for chunk '{chunk}'");
        }
        if content.len() > MAX_INPUT_TOKENS {
            bail!(
                "phonemized chunk produced {} tokens (max {MAX_INPUT_TOKENS}). \
                 Reduce --max-chars to produce shorter chunks",
                content.len()
            );
        }

        let mut input_ids = Vec::with_capacity(content.len() + 2);
        input_ids.push(TOKEN_PAD_ID);
        input_ids.extend_from_slice(&content);
        input_ids.push(TOKEN_PAD_ID);

        let prior = self
            .speed_priors
            .get(request.speaker_id)
            .copied()
            .unwrap_or(1.0);
        let inputs = ChunkInputs {
            input_ids,
            style: request.speaker.style_for_tokens(content.len())?.to_vec(),
            speed: request.speed * prior,
            language_id: request.language_id,
        };
        debug!(tokens = inputs.input_ids.len(), speed = inputs.speed, "running inference for chunk");

        let mut audio = self.model.infer(inputs)?;
        audio.truncate(audio.len().saturating_sub(self.trim_tail));
        Ok(audio)
    }
}

fn normalize_whitespace(text: &str) -> String {
    SPACES_RE.replace_all(text.trim(), " ").into_owned()
}

fn text_preview(text: &str) -> String {
    text.chars().take(TEXT_PREVIEW_CHARS).collect()
}

/// Chunks end in punctuation so each one closes as an utterance.
fn close_chunk(text: &str) -> String {
    let text = text.trim();
    match text.chars().last() {
        None => String::new(),
        Some('.' | '!' | '?' | ',' | ';' | ':') => text.to_string(),
        Some(_) => format!("{text},"),
    }
}

/// Splits on sentence punctuation, then packs words into chunks of at most
/// `max_len` characters. A single word longer than `max_len` stays whole.
fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let sentences = SENTENCE_SPLIT_RE
        .split(text)
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty());

    for sentence in sentences {
        if sentence.chars().count() <= max_len {
            chunks.push(close_chunk(sentence));
            continue;
        }

        let mut words = sentence.split_whitespace();
        let Some(first) = words.next() else {
            continue;
        };
        let mut current = first.to_string();
        let mut current_len = first.chars().count();
        for word in words {
            let word_len = word.chars().count();
            if current_len + 1 + word_len > max_len {
                chunks.push(close_chunk(&current));
                current.clear();
                current_len = 0;
            } else {
                current.push(' ');
                current_len += 1;
            }
            current.push_str(word);
            current_len += word_len;
        }
        chunks.push(close_chunk(&current));
    }

    chunks
}

/// Config entries must name a file directly inside the model directory.
fn plain_file_name(value: &str) -> Result<&str> {
    let is_plain = !value.contains(['/', '\\'])
        && Path::new(value).file_name() == Some(OsStr::new(value));
    if !is_plain {
        bail!("model config names '{value}', expected a plain file name");
    }
    Ok(value)
}

/// Cache layout mirrors the hub's `models--owner--name`, suffixed with a
/// digest of the exact repo id so sanitized names cannot collide.
fn hub_cache_dir(cache_root: &Path, repo_id: &str) -> PathBuf {
    let slug = repo_id
        .split('/')
        .map(|part| {
            part.chars()
                .map(|c| match c {
                    'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                    _ => '_',
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("--");
    let digest = Sha256::digest(repo_id.as_bytes());
    cache_root.join(format!("models--{slug}--{}", hex::encode(&digest[..4])))
}

fn hub_file_url(repo_id: &str, file_name: &str) -> String {
    format!("{HUB_BASE_URL}/{repo_id}/resolve/main/{file_name}")
}

fn hub_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(HUB_CONNECT_TIMEOUT)
        .timeout(HUB_DOWNLOAD_TIMEOUT)
        .build()
        .context("failed building model download client")
}

fn resolve_model_artifacts(selection: &ModelSelection) -> Result<ModelArtifacts> {
    if let Some(model_dir) = &selection.model_dir {
        return load_local_model(model_dir);
    }
    let cache_root = selection.resolve_cache_dir()?;
    let repo_id = selection.resolve_repo_id();
    ensure_hub_model(&hub_client()?, &cache_root, &repo_id, selection.force_download)
}

fn load_local_model(model_dir: &Path) -> Result<ModelArtifacts> {
    let config_path = model_dir.join("config.json");
    if !config_path.is_file() {
        bail!(
            "model directory {} does not contain config.json",
            model_dir.display()
        );
    }
    let config = ModelConfig::load(&config_path)?;
    let model_path = model_dir.join(plain_file_name(&config.model_file)?);
    let speakers_path = model_dir.join(plain_file_name(&config.speakers)?);

    Ok(ModelArtifacts {
        name: model_dir.display().to_string(),
        model_dir: model_dir.to_path_buf(),
        model_path,
        speakers_path,
        config,
    })
}

/// Makes sure `config.json` and the two files it names are in the cache,
/// downloading what is missing (or everything when `force` is set).
fn ensure_hub_model(
    client: &Client,
    cache_root: &Path,
    repo_id: &str,
    force: bool,
) -> Result<ModelArtifacts> {
    let model_dir = hub_cache_dir(cache_root, repo_id);
    fs::create_dir_all(&model_dir)
        .with_context(|| format!("failed creating cache dir {}", model_dir.display()))?;

    let mut fetched = Vec::new();
    let config_path = model_dir.join("config.json");
    if force || !config_path.exists() {
        fetch_hub_file(client, repo_id, "config.json", &config_path)?;
        fetched.push("config.json");
    }
    let config = ModelConfig::load(&config_path)?;
    let model_file = plain_file_name(&config.model_file)?;
    let speakers_file = plain_file_name(&config.speakers)?;

    for file_name in [model_file, speakers_file] {
        let dest = model_dir.join(file_name);
        if force || !dest.exists() {
            fetch_hub_file(client, repo_id, file_name, &dest)?;
            fetched.push(file_name);
        } else {
            debug!(file = file_name, "using cached model file");
        }
    }

    let manifest_path = model_dir.join("manifest.json");
    if !fetched.is_empty() || !manifest_path.exists() {
        let manifest = CacheManifest {
            repo_id: repo_id.to_string(),
            fetched_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default(),
            model_file: model_file.to_string(),
            speakers_file: speakers_file.to_string(),
        };
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
            .with_context(|| format!("failed writing manifest at {}", manifest_path.display()))?;
        debug!(?fetched, "updated cache manifest");
    }

    Ok(ModelArtifacts {
        name: repo_id.to_string(),
        model_path: model_dir.join(model_file),
        speakers_path: model_dir.join(speakers_file),
        model_dir,
        config,
    })
}

/// Streams one repo file into the cache. Bytes land in a temp file beside
/// `dest`, which only a completed download replaces.
fn fetch_hub_file(client: &Client, repo_id: &str, file_name: &str, dest: &Path) -> Result<()> {
    let url = hub_file_url(repo_id, file_name);
    info!(%url, "downloading model file");

    let cache_dir = dest
        .parent()
        .ok_or_else(|| anyhow!("cache path {} has no parent directory", dest.display()))?;
    let mut response = client
        .get(&url)
        .send()
        .with_context(|| format!("request for {file_name} from {repo_id} failed"))?
        .error_for_status()
        .with_context(|| format!("download of {file_name} from {repo_id} failed"))?;

    let mut staged = tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(cache_dir)
        .with_context(|| format!("failed staging download in {}", cache_dir.display()))?;
    let bytes = io::copy(&mut response, staged.as_file_mut())
        .with_context(|| format!("failed receiving {file_name} from {repo_id}"))?;
    staged
        .persist(dest)
        .with_context(|| format!("failed moving download into {}", dest.display()))?;
    debug!(file = file_name, bytes, "cached model file");
    Ok(())
}

/// Writes mono audio next to `path` first and renames it into place, so a
/// failed write never leaves a truncated file at `path`.
fn write_wav(path: &Path, sample_rate: u32, encoding: WavEncoding, audio: &[f32]) -> Result<()> {
    let (bits_per_sample, sample_format) = match encoding {
        WavEncoding::Pcm16 => (16, hound::SampleFormat::Int),
        WavEncoding::Float32 => (32, hound::SampleFormat::Float),
    };
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample,
        sample_format,
    };

    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let staged = tempfile::Builder::new()
        .prefix(".polyglot-tts-")
        .suffix(".wav")
        .tempfile_in(parent)
        .with_context(|| format!("failed creating temporary wav file in {}", parent.display()))?;

    let mut writer = hound::WavWriter::create(staged.path(), spec)
        .with_context(|| format!("failed creating wav file {}", staged.path().display()))?;
    for &sample in audio {
        match encoding {
            WavEncoding::Pcm16 => {
                let scaled = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer.write_sample(scaled)?;
            }
            WavEncoding::Float32 => writer.write_sample(sample)?,
        }
    }
    writer.finalize()?;

    staged
        .persist(path)
        .with_context(|| format!("failed moving wav file into {}", path.display()))?;
    Ok(())
}

fn output_is_populated(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Writes the waveform, then confirms the file landed with content.
fn save_audio(path: &Path, sample_rate: u32, encoding: WavEncoding, audio: &[f32]) -> Result<()> {
    write_wav(path, sample_rate, encoding, audio)?;
    debug!(samples = audio.len(), sample_rate, "wrote wav");
    if !output_is_populated(path) {
        bail!("Generated audio file is empty or missing: {}", path.display());
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let language = cli.language_code.to_lowercase();
    if !is_supported_language(&language) {
        println!(
            "Warning: Language code '{language}' might not be supported by the model. Supported: {SUPPORTED_LANGUAGES:?}"
        );
    }

    println!("Loading TTS model '{}'...", cli.model.display_name());
    let artifacts = resolve_model_artifacts(&cli.model)?;
    let config = &artifacts.config;
    debug!(name = %artifacts.name, dir = %artifacts.model_dir.display(), "resolved model artifacts");

    if config.languages.is_empty() {
        println!("Info: The model does not declare its supported languages.");
    } else {
        println!("Available languages: {:?}", config.languages);
    }

    let speakers = SpeakerTable::load(&artifacts.speakers_path)?;
    println!("Available speaker IDs: {:?}", speakers.ids());
    if speakers.is_empty() {
        bail!("No speakers found in the loaded model.");
    }
    let speaker_id = speakers.resolve_speaker(cli.speaker.as_deref(), config)?;
    let language_id = config.language_id(&language)?;

    let phonemizer = detect_phonemizer(cli.phonemizer)?;
    let model = OnnxModel::load(
        &artifacts.model_path,
        &cli.model.resolve_ort_runtime_config(),
    )?;
    let mut synthesizer = Synthesizer::new(
        model,
        config.speed_priors.clone(),
        cli.trim_tail.unwrap_or(config.trim_tail),
    );

    println!(
        "Model loaded. Generating audio for text: '{}...' in language '{language}' using speaker '{speaker_id}'",
        text_preview(&cli.text)
    );

    let request = SynthesisRequest {
        speaker_id: &speaker_id,
        speaker: speakers.get(&speaker_id)?,
        espeak_voice: espeak_voice(&language),
        language_id,
        speed: cli.speed,
        max_chars: cli.max_chars,
    };
    let audio = synthesizer.synthesize(&cli.text, &request, &phonemizer)?;
    save_audio(&cli.output_path, config.sample_rate, cli.wav_encoding, &audio)?;

    println!(
        "Generated audio file successfully: {}",
        cli.output_path.display()
    );
    Ok(())
}

fn print_usage_error(err: &clap::Error) -> ExitCode {
    if matches!(
        err.kind(),
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
    ) {
        let _ = err.print();
        return ExitCode::SUCCESS;
    }
    println!("Usage: polyglot-tts <text> <output_path> <language_code>");
    println!("Example: polyglot-tts 'Hello World' 'output.wav' 'en'");
    let _ = err.print();
    ExitCode::FAILURE
}

/// Error line, cause chain and a stack trace. The trace is the one anyhow
/// captured at the error site when `RUST_BACKTRACE` enabled that, otherwise
/// one taken here.
fn error_report(err: &anyhow::Error) -> String {
    let mut report = format!("Error: {err}\n");
    for cause in err.chain().skip(1) {
        report.push_str(&format!("  caused by: {cause}\n"));
    }
    report.push_str("Stack backtrace:\n");
    let captured = err.backtrace();
    if captured.status() == BacktraceStatus::Captured {
        report.push_str(&captured.to_string());
    } else {
        report.push_str(&Backtrace::force_capture().to_string());
    }
    report
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
}

fn main() -> ExitCode {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => return print_usage_error(&err),
    };

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", error_report(&err));
            ExitCode::FAILURE
        }
    }
}
