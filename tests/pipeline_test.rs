//! Integration tests: the full prompt-compilation pipeline using library
//! modules directly, without spawning any real AI driver binary:
//! parse front matter, bind variables, expand directives, render the
//! template, and compile driver argv.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use mdflow::adapters;
use mdflow::cli::run::{driver_from_filename, filename_interactive};
use mdflow::core::cancel::CancelToken;
use mdflow::core::compiler;
use mdflow::core::config;
use mdflow::core::dashboard::Dashboard;
use mdflow::core::directive::parse_directives;
use mdflow::core::document::Document;
use mdflow::core::error::AgentError;
use mdflow::core::resolver::{ResolveOptions, Resolver};
use mdflow::core::template::{Template, TmplValue, VarMap};
use mdflow::core::vars::{build_bindings, parse_remaining_args};

// ---------- Helpers ----------

fn write(dir: &Path, rel: &str, content: &str) -> PathBuf {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

fn resolver() -> Resolver {
    Resolver::new(
        ResolveOptions::default(),
        CancelToken::new(),
        Dashboard::disabled(),
    )
}

async fn expand(body: &str, base: &Path) -> Result<String, AgentError> {
    resolver()
        .expand(body.to_string(), base.to_path_buf(), Vec::new())
        .await
}

/// Merge built-in adapter defaults with front matter, the way the
/// orchestrator does before compiling argv.
fn merged_config(driver: &str, front: &serde_yaml::Mapping) -> serde_yaml::Mapping {
    let mut merged = adapters::adapter_for(driver).defaults();
    for (k, v) in front {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

fn bindings_to_vars(bindings: &std::collections::BTreeMap<String, String>) -> VarMap {
    bindings
        .iter()
        .map(|(k, v)| (k.clone(), TmplValue::Str(v.clone())))
        .collect()
}

// ---------- Scenario 1: trivial print-mode run ----------

#[test]
fn test_trivial_agent_compiles_to_print_argv() {
    let doc = Document::parse("Say hi.").unwrap();
    assert!(doc.config.is_empty());

    let driver = driver_from_filename("hello.claude.md").unwrap();
    assert_eq!(driver, "claude");
    assert!(!filename_interactive("hello.claude.md"));

    let merged = merged_config(&driver, &doc.config);
    let template = Template::parse(&doc.body).unwrap();
    let rendered = template.render(&VarMap::new());

    let compiled = compiler::compile(&merged, &template.free_variables(), &[rendered]);
    let argv = compiled.into_argv(&[]);
    assert_eq!(argv, vec!["--print".to_string(), "Say hi.".to_string()]);
}

// ---------- Scenario 2: positional mapping ----------

#[test]
fn test_positional_mapping_remaps_prompt_to_flag() {
    let raw = "---\n$1: prompt\n---\nTranslate {{ _1 }} to {{ _2 }}.";
    let doc = Document::parse(raw).unwrap();

    let parsed = parse_remaining_args(&["hola".to_string(), "English".to_string()]);
    let merged = merged_config("copilot", &doc.config);
    let bindings = build_bindings(&merged, &parsed, None);

    let template = Template::parse(&doc.body).unwrap();
    let rendered = template.render(&bindings_to_vars(&bindings));
    assert_eq!(rendered, "Translate hola to English.");

    let consumed = template.free_variables();
    assert!(consumed.contains("_1"));
    assert!(consumed.contains("_2"));

    let compiled = compiler::compile(&merged, &consumed, &[rendered.clone()]);
    let argv = compiled.into_argv(&[]);
    assert_eq!(
        argv,
        vec![
            "--silent".to_string(),
            "--prompt".to_string(),
            "Translate hola to English.".to_string(),
        ]
    );
}

// ---------- Scenario 3: fenced directives stay inert ----------

#[tokio::test]
async fn test_glob_expands_while_fenced_directive_is_untouched() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "src/util.ts", "export const x = 1;");
    write(tmp.path(), "secret.txt", "should never be read");

    let body = "See @./src/*.ts.\n\n```md\nExample: @./secret.txt\n```\n";
    let directives = parse_directives(body);
    assert_eq!(directives.len(), 1, "only the glob outside the fence");

    let out = expand(body, tmp.path()).await.unwrap();
    assert!(out.contains("<util path=\"src/util.ts\">"));
    assert!(out.contains("export const x = 1;"));
    assert!(
        out.contains("```md\nExample: @./secret.txt\n```"),
        "the fenced block must be untouched: {out}"
    );
    assert!(!out.contains("should never be read"));
}

// ---------- Scenario 4: circular imports ----------

#[tokio::test]
async fn test_circular_import_names_the_chain() {
    let tmp = TempDir::new().unwrap();
    let a = write(tmp.path(), "a.claude.md", "@./b.md");
    write(tmp.path(), "b.md", "@./a.claude.md");

    let r = resolver();
    let canonical_a = std::fs::canonicalize(&a).unwrap();
    let err = r
        .expand(
            std::fs::read_to_string(&a).unwrap(),
            tmp.path().to_path_buf(),
            vec![canonical_a],
        )
        .await
        .unwrap_err();

    match err {
        AgentError::CircularImport { chain } => {
            assert_eq!(chain, "a.claude.md -> b.md -> a.claude.md");
        }
        other => panic!("expected CircularImport, got {other:?}"),
    }
}

// ---------- Scenario 5: executable fence ----------

#[cfg(unix)]
#[tokio::test]
async fn test_exec_fence_output_renders_into_prompt() {
    let tmp = TempDir::new().unwrap();
    let body = "Now:\n```sh\n#!/bin/sh\necho ok\n```\n";

    let expanded = expand(body, tmp.path()).await.unwrap();
    assert_eq!(expanded, "Now:\n{% raw %}\nok\n{% endraw %}\n");

    let rendered = Template::parse(&expanded).unwrap().render(&VarMap::new());
    assert_eq!(rendered, "Now:\nok\n");
}

// ---------- Scenario 6: interactive toggle via filename ----------

#[test]
fn test_interactive_marker_strips_print_flag() {
    let raw = "---\nprint: true\n---\nDo the task.";
    let doc = Document::parse(raw).unwrap();

    let driver = driver_from_filename("task.i.claude.md").unwrap();
    assert_eq!(driver, "claude");
    assert!(filename_interactive("task.i.claude.md"));

    let merged = merged_config(&driver, &doc.config);
    let interactive = adapters::adapter_for(&driver).apply_interactive(merged);

    let compiled = compiler::compile(&interactive, &BTreeSet::new(), &["Do the task.".to_string()]);
    let argv = compiled.into_argv(&[]);
    assert_eq!(argv, vec!["Do the task.".to_string()]);
    assert!(!argv.iter().any(|a| a == "--print"));
}

// ---------- Boundary behaviors ----------

#[tokio::test]
async fn test_empty_body_no_directives_no_error() {
    let tmp = TempDir::new().unwrap();
    assert!(parse_directives("").is_empty());
    assert_eq!(expand("", tmp.path()).await.unwrap(), "");
}

#[test]
fn test_body_of_single_fence_has_zero_directives() {
    let body = "```\n@./x.md\n```\n";
    assert!(parse_directives(body).is_empty());
}

#[tokio::test]
async fn test_glob_matching_zero_files_is_empty_not_error() {
    let tmp = TempDir::new().unwrap();
    let out = expand("@./missing/*.ts", tmp.path()).await.unwrap();
    assert_eq!(out, "");
}

#[test]
fn test_var_flag_value_with_spaces_binds() {
    let parsed = parse_remaining_args(&["--_name=value with spaces".to_string()]);
    let bindings = build_bindings(&serde_yaml::Mapping::new(), &parsed, None);
    assert_eq!(
        bindings.get("_name").map(String::as_str),
        Some("value with spaces")
    );
}

// ---------- Laws ----------

#[test]
fn test_document_round_trip_for_plain_body() {
    let body = "No front matter here.\nJust prose.\n";
    let doc = Document::parse(body).unwrap();
    assert!(doc.config.is_empty());
    assert_eq!(doc.body, body);
}

#[test]
fn test_config_merge_is_idempotent() {
    let layer: serde_yaml::Mapping = serde_yaml::from_str(
        "model: opus\ncommands:\n  claude:\n    print: true\n",
    )
    .unwrap();
    assert_eq!(config::merge(&layer, &layer), layer);
}

#[tokio::test]
async fn test_dry_run_matches_real_run_modulo_commands() {
    // With no command directives, dry-run and real resolution produce the
    // same expanded body.
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "part.md", "imported part");
    let body = "Intro @./part.md outro";

    let real = expand(body, tmp.path()).await.unwrap();
    let dry = Resolver::new(
        ResolveOptions {
            dry_run: true,
            ..ResolveOptions::default()
        },
        CancelToken::new(),
        Dashboard::disabled(),
    )
    .expand(body.to_string(), tmp.path().to_path_buf(), Vec::new())
    .await
    .unwrap();
    assert_eq!(real, dry);
}

#[tokio::test]
async fn test_dry_run_replaces_commands_with_placeholders() {
    let tmp = TempDir::new().unwrap();
    let dry = Resolver::new(
        ResolveOptions {
            dry_run: true,
            ..ResolveOptions::default()
        },
        CancelToken::new(),
        Dashboard::disabled(),
    )
    .expand(
        "run !`echo hi` now".to_string(),
        tmp.path().to_path_buf(),
        Vec::new(),
    )
    .await
    .unwrap();
    assert!(dry.contains("[Dry Run: Command \"echo hi\" not executed]"));
}

// ---------- End-to-end: imports + variables + argv together ----------

#[cfg(unix)]
#[tokio::test]
async fn test_full_pipeline_with_imports_commands_and_variables() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "style.md", "Be terse.");

    let raw = "---\nmodel: opus\n_tone: polite\n---\n\
               Rules: @./style.md\nHost: !`echo fakehost`\nTone: {{ _tone }}.\n";
    let doc = Document::parse(raw).unwrap();

    let merged = merged_config("claude", &doc.config);
    let parsed = parse_remaining_args(&[]);
    let bindings = build_bindings(&merged, &parsed, None);

    let r = Resolver::new(
        ResolveOptions {
            vars: Arc::new(bindings_to_vars(&bindings)),
            ..ResolveOptions::default()
        },
        CancelToken::new(),
        Dashboard::disabled(),
    );
    let expanded = r
        .expand(doc.body.clone(), tmp.path().to_path_buf(), Vec::new())
        .await
        .unwrap();

    let template = Template::parse(&expanded).unwrap();
    let rendered = template.render(&bindings_to_vars(&bindings));
    assert!(rendered.contains("Rules: Be terse."));
    assert!(rendered.contains("Host: fakehost"));
    assert!(rendered.contains("Tone: polite."));

    let compiled = compiler::compile(&merged, &template.free_variables(), &[rendered]);
    let argv = compiled.into_argv(&[]);
    assert_eq!(argv[0], "--print");
    assert_eq!(argv[1], "--model");
    assert_eq!(argv[2], "opus");
    assert!(argv.last().unwrap().contains("Be terse."));
    // The template-default key never becomes a flag
    assert!(!argv.iter().any(|a| a.contains("tone")));
}
