use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;
use crate::fence::{CloseBreak, EndPolicy, FenceStyle};

#[derive(Parser, Debug)]
#[command(name = "pagecast")]
#[command(version)]
#[command(about = "Stream an LLM completion and extract the fenced code block as it arrives")]
pub struct Args {
    /// Prompt to send to the completion API
    #[arg(required_unless_present = "serve")]
    pub prompt: Option<String>,

    /// TOML config file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Run the HTTP entry point instead of a one-shot generation
    #[arg(long)]
    pub serve: bool,

    /// Address to bind in --serve mode
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to bind in --serve mode
    #[arg(long)]
    pub port: Option<u16>,

    /// Model name (e.g. gpt-3.5-turbo, gpt-4o-mini)
    #[arg(long, short)]
    pub model: Option<String>,

    /// Delimiter style enclosing the content
    #[arg(long, value_enum)]
    pub fence: Option<FenceStyle>,

    /// Final value when the stream ends before a closing fence
    #[arg(long, value_enum)]
    pub on_unclosed: Option<EndPolicy>,

    /// Keep or strip the line break before a closing code fence
    #[arg(long, value_enum)]
    pub close_break: Option<CloseBreak>,

    /// Write the extracted content to this file instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Echo raw tokens to stdout while streaming
    #[arg(long)]
    pub raw: bool,

    /// Generate through a running pagecast server (e.g. http://127.0.0.1:8888)
    #[arg(long, conflicts_with = "serve")]
    pub remote: Option<String>,
}

impl Args {
    /// Overlay the flags that were given on top of `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(model) = &self.model {
            config.upstream.model = model.clone();
        }
        if let Some(fence) = self.fence {
            config.extract.fence = fence;
        }
        if let Some(policy) = self.on_unclosed {
            config.extract.on_unclosed = policy;
        }
        if let Some(close_break) = self.close_break {
            config.extract.close_break = close_break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from(["pagecast", "a landing page"]);
        assert_eq!(args.prompt.as_deref(), Some("a landing page"));
        assert!(!args.serve);
        assert!(!args.raw);
        assert!(args.config.is_none());
        assert!(args.port.is_none());
        assert!(args.fence.is_none());
        assert!(args.remote.is_none());
    }

    #[test]
    fn test_args_parse_full() {
        let args = Args::parse_from([
            "pagecast",
            "a todo app",
            "--config",
            "pagecast.toml",
            "--model",
            "gpt-4o-mini",
            "--fence",
            "single",
            "--on-unclosed",
            "whole-buffer",
            "--output",
            "page.html",
            "--raw",
        ]);
        assert_eq!(args.prompt.as_deref(), Some("a todo app"));
        assert_eq!(args.config, Some(PathBuf::from("pagecast.toml")));
        assert_eq!(args.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(args.fence, Some(FenceStyle::Single));
        assert_eq!(args.on_unclosed, Some(EndPolicy::WholeBuffer));
        assert_eq!(args.output, Some(PathBuf::from("page.html")));
        assert!(args.raw);
    }

    #[test]
    fn test_args_serve_without_prompt() {
        let args = Args::parse_from(["pagecast", "--serve", "--bind", "0.0.0.0", "--port", "9000"]);
        assert!(args.serve);
        assert!(args.prompt.is_none());
        assert_eq!(args.bind.as_deref(), Some("0.0.0.0"));
        assert_eq!(args.port, Some(9000));
    }

    #[test]
    fn test_args_prompt_required_without_serve() {
        assert!(Args::try_parse_from(["pagecast"]).is_err());
    }

    #[test]
    fn test_args_remote_conflicts_with_serve() {
        assert!(Args::try_parse_from(["pagecast", "--serve", "--remote", "http://x"]).is_err());
    }

    #[test]
    fn test_args_rejects_unknown_fence() {
        assert!(Args::try_parse_from(["pagecast", "p", "--fence", "double"]).is_err());
    }

    #[test]
    fn test_apply_overrides_only_given_flags() {
        let mut config = Config::default();
        let args = Args::parse_from(["pagecast", "p", "--port", "3000", "--on-unclosed", "whole-buffer"]);
        args.apply(&mut config);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.extract.on_unclosed, EndPolicy::WholeBuffer);
        assert_eq!(config.extract.fence, FenceStyle::Triple);
        assert_eq!(config.upstream.model, "gpt-3.5-turbo");
    }

    #[test]
    fn test_apply_close_break() {
        let mut config = Config::default();
        Args::parse_from(["pagecast", "p"]).apply(&mut config);
        assert_eq!(config.extract.close_break, CloseBreak::Keep);
        Args::parse_from(["pagecast", "p", "--close-break", "strip"]).apply(&mut config);
        assert_eq!(config.extract.close_break, CloseBreak::Strip);
    }

    #[test]
    fn test_apply_model() {
        let mut config = Config::default();
        Args::parse_from(["pagecast", "p", "-m", "gpt-4"]).apply(&mut config);
        assert_eq!(config.upstream.model, "gpt-4");
    }
}
