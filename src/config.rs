// IMPORTANT:
// Keep ALL numeric values centralized here (repo rule: no hardcoded numeric values scattered around).
//
// There are deliberately no CLI flags, env vars, or config files: the model
// identifier, output directory, dummy sentence, and quantization scheme are
// fixed constants of this one-shot conversion tool.

// NOTE: TOOL_VERSION must stay in sync with the `version` field in Cargo.toml.
pub const TOOL_VERSION: &str = "0.1.0";

pub mod model {
    /// Hugging Face identifier of the model being converted.
    pub const MODEL_ID: &str = "BAAI/bge-small-en-v1.5";

    /// Short name used for the quantized artifact file name.
    pub const MODEL_SHORT_NAME: &str = "bge-small-en-v1.5";

    /// Output directory, relative to the working directory. Created if absent.
    pub const OUTPUT_DIR: &str = "bge-small-onnx";

    /// Registry base URL for raw artifact downloads (main revision).
    pub const REGISTRY_BASE: &str = "https://huggingface.co/BAAI/bge-small-en-v1.5/resolve/main";

    /// Artifact set fetched from the registry: tokenizer files, architecture
    /// config, and safetensors weights. All five must exist locally before
    /// the export stage runs.
    pub const ARTIFACT_FILES: [&str; 5] = [
        "config.json",
        "tokenizer.json",
        "tokenizer_config.json",
        "special_tokens_map.json",
        "model.safetensors",
    ];
}

pub mod fetch {
    pub const DOWNLOAD_TIMEOUT_SECS: u64 = 90;
}

pub mod export {
    /// Representative sentence used to trace the forward pass before export.
    pub const DUMMY_SENTENCE: &str = "This is a sample sentence for conversion.";

    /// Max word-piece tokens for the trace input (BERT context limit is 512).
    pub const MAX_TOKENS: usize = 512;

    /// ONNX operator set version the exported graph targets.
    pub const OPSET_VERSION: i64 = 14;

    /// ONNX IR version paired with opset 14.
    pub const IR_VERSION: i64 = 7;

    pub const ONNX_FILE: &str = "model.onnx";
    pub const GRAPH_NAME: &str = "bge_small_en_v1_5";

    // Fixed tensor names of the exported graph contract.
    pub const INPUT_IDS: &str = "input_ids";
    pub const ATTENTION_MASK: &str = "attention_mask";
    pub const LAST_HIDDEN_STATE: &str = "last_hidden_state";

    // Dynamic axis labels (batch and sequence resolved at inference time).
    pub const DYN_BATCH: &str = "batch_size";
    pub const DYN_SEQUENCE: &str = "sequence_length";

    /// Additive value for masked-out attention positions.
    pub const ATTENTION_MASK_FILL: f32 = -10000.0;
}

pub mod quantize {
    /// Suffix appended to the model short name for the quantized artifact.
    pub const QUANTIZED_SUFFIX: &str = "-quantized.onnx";

    /// Levels of the uint8 quantization grid (0..=255).
    pub const QUANT_LEVELS: f32 = 255.0;

    /// Scale floor for constant weight tensors (range zero), avoids div by zero.
    pub const MIN_SCALE: f32 = 1.0;
}
