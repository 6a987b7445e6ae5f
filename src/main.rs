//! Bolt - AI 编码助手（批处理模式 CLI）
//!
//! 入口：初始化日志、加载配置、创建 CodeAgent，并运行交互式命令循环。
//! 一次只服务一个操作者，每一步按顺序 await。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bolt::agent::CodeAgent;
use bolt::config::load_config;
use bolt::execution::{AttemptOutcome, ExecutionReport, Language};
use bolt::llm::OpenAiClient;
use bolt::sandbox::{create_service, ExecOutput};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const HELP: &str = "\
Commands:
  /run <prompt>     Generate and execute code (auto-fix on errors)
  /gen <prompt>     Generate code only
  /exec             Execute the last generated code
  /explain          Explain the last generated code
  /lang <language>  Change language (python, javascript, bash)
  /model [id]       Show or change the model
  /models           List available models
  /clear            Clear conversation history
  /help             Show this help
  /quit             Exit
Anything else is sent as a chat message.";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // 日志走 stderr，默认 bolt=info，可通过 RUST_LOG 覆盖
    bolt::observability::init_stderr();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let llm = Arc::new(OpenAiClient::from_config(&cfg.llm));
    let service = create_service(&cfg.sandbox).context("Failed to create sandbox service")?;
    let mut agent = CodeAgent::from_config(&cfg, llm, service).await;

    println!("Bolt - AI coding agent ({})", cfg.llm.model);
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let language = agent.language().await.unwrap_or_default();
        stdout.write_all(format!("\n[{}] you> ", language).as_bytes()).await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted.");
                break;
            }
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let (cmd, args) = match input.split_once(' ') {
            Some((cmd, args)) => (cmd, args.trim()),
            None => (input, ""),
        };

        if !cmd.starts_with('/') {
            match agent.chat(input).await {
                Ok(reply) => println!("{}", reply),
                Err(e) => eprintln!("Error [{}]: {}", e.kind(), e),
            }
            continue;
        }

        match cmd.to_lowercase().as_str() {
            "/quit" | "/exit" | "/q" => break,
            "/help" => println!("{}", HELP),
            "/run" => {
                if args.is_empty() {
                    eprintln!("Usage: /run <prompt>");
                    continue;
                }
                match agent.run(args, cfg.execution.auto_fix).await {
                    Ok(report) => print_report(&report),
                    Err(e) => eprintln!("Error [{}]: {}", e.kind(), e),
                }
            }
            "/gen" => {
                if args.is_empty() {
                    eprintln!("Usage: /gen <prompt>");
                    continue;
                }
                match agent.generate(args).await {
                    Ok(code) => print_code(language, &code),
                    Err(e) => eprintln!("Error [{}]: {}", e.kind(), e),
                }
            }
            "/exec" => match agent.execute_last().await {
                Ok(out) => print_output(&out),
                Err(e) => eprintln!("Error [{}]: {}", e.kind(), e),
            },
            "/explain" => match agent.explain(None).await {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("Error [{}]: {}", e.kind(), e),
            },
            "/lang" => match args.parse::<Language>() {
                Ok(lang) => match agent.set_language(lang).await {
                    Ok(()) => println!("Language set to: {}", lang),
                    Err(e) => eprintln!("Error [{}]: {}", e.kind(), e),
                },
                Err(e) => eprintln!("{}", e),
            },
            "/model" => {
                if args.is_empty() {
                    match agent.model().await {
                        Ok(model) => println!("Model: {}", model),
                        Err(e) => eprintln!("Error [{}]: {}", e.kind(), e),
                    }
                    continue;
                }
                match agent.set_model(args).await {
                    Ok(()) => println!("Model set to: {}", args),
                    Err(e) => eprintln!("Error [{}]: {}", e.kind(), e),
                }
            }
            "/models" => match agent.list_models().await {
                Ok(models) if models.is_empty() => println!("No models reported."),
                Ok(models) => {
                    for m in models {
                        println!("  {:<50} {}", m.id, m.name);
                    }
                }
                Err(e) => eprintln!("Error [{}]: {}", e.kind(), e),
            },
            "/clear" => match agent.clear().await {
                Ok(()) => println!("History cleared."),
                Err(e) => eprintln!("Error [{}]: {}", e.kind(), e),
            },
            other => {
                eprintln!("Unknown command: {}", other);
                eprintln!("Type /help for available commands.");
            }
        }
    }

    println!("Goodbye!");
    agent.cleanup().await;
    Ok(())
}

fn print_code(language: Language, code: &str) {
    println!("--- {} ---", language.display_name());
    println!("{}", code.trim_end());
    println!("---");
}

fn print_output(out: &ExecOutput) {
    if !out.stdout.is_empty() {
        println!("Output:\n{}", out.stdout.trim_end());
    }
    if !out.stderr.is_empty() {
        eprintln!("Errors:\n{}", out.stderr.trim_end());
    }
    println!("(exit code {})", out.exit_code);
}

fn print_report(report: &ExecutionReport) {
    for attempt in &report.attempts {
        match attempt.outcome {
            AttemptOutcome::Fatal => {
                eprintln!(
                    "Attempt {} aborted: {}",
                    attempt.attempt,
                    attempt.error.as_deref().unwrap_or("unknown error")
                );
            }
            _ => {
                if attempt.attempt > 1 {
                    println!("Fixed code (attempt {}):", attempt.attempt);
                }
                print_code(report.language, &attempt.code);
                if !attempt.stdout.is_empty() {
                    println!("Output:\n{}", attempt.stdout.trim_end());
                }
                if !attempt.stderr.is_empty() {
                    eprintln!("Errors:\n{}", attempt.stderr.trim_end());
                }
            }
        }
    }
    if report.succeeded() {
        if report.retries() > 0 {
            println!("Code fixed after {} retries.", report.retries());
        }
    } else {
        eprintln!("Execution failed after {} attempts.", report.attempts.len());
    }
}
