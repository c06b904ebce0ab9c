//! Example: one chat turn against a local or Hub model
//!
//! Run with:
//!   cargo run --example generate -- --prompt "What is the capital of France?"
//!   cargo run --example generate -- --model /models/llama --prompt "Hello" --directory ./docs

use anyhow::Result;
use ember_core::{ChatMessage, GenerationRequest, ServiceConfig, ServiceContext, QUERY_DEFAULT_TEMPERATURE};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let arg = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
    };

    let prompt = arg("--prompt").unwrap_or("What is the capital of France?");
    let model_id = arg("--model").unwrap_or("HuggingFaceTB/SmolLM2-135M-Instruct");
    let max_tokens = arg("--max-tokens").and_then(|s| s.parse().ok()).unwrap_or(50);
    let directory = arg("--directory");

    let use_cuda = cfg!(feature = "cuda") && candle_core::Device::cuda_if_available(0).is_ok();
    let config = if use_cuda {
        ServiceConfig {
            dtype: candle_core::DType::F16,
            device: candle_core::Device::cuda_if_available(0)?,
            ..Default::default()
        }
    } else {
        ServiceConfig::default()
    };

    println!("Model: {}", model_id);
    println!("Prompt: {}", prompt);
    println!();

    let service = ServiceContext::new(config);
    println!("Loading model...");
    service.init(model_id)?;

    if let Some(directory) = directory {
        let summary = service.index(directory)?;
        println!("Indexed {} documents ({} chunks)", summary.documents, summary.chunks);
    }

    let mut request = GenerationRequest::new(vec![ChatMessage::user(prompt)]);
    request.max_tokens = max_tokens;
    request.directory = directory.map(String::from);

    let response = service.query(&request, QUERY_DEFAULT_TEMPERATURE)?;
    println!("---");
    println!("{}", response.content());
    println!("---");
    println!("Prompt tokens: {}", response.usage.prompt_tokens);
    println!("Completion tokens: {}", response.usage.completion_tokens);

    Ok(())
}
