use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::catalog::{Credentials, Pagination};
use crate::cli::DumpArgs;
use crate::retry::RetryConfig;
use crate::sync::resize::ResizeConfig;
use crate::sync::DumpConfig;

/// Upper bound on a single content body.
const MAX_CONTENT_BYTES: u64 = 512 * 1024 * 1024;

/// Validated `dump` configuration.
pub struct Config {
    pub directory: PathBuf,
    pub base_url: String,
    pub username: String,
    pub api_key: Option<String>,
    pub pagination: Pagination,
    pub extensions: Vec<String>,

    pub end_id: Option<u64>,
    pub end_page: Option<u64>,
    pub retry_delay_secs: u64,
    pub resize_threshold_kb: u64,

    pub limit: u32,
    pub retry_attempts: u32,
    pub resize_width: u32,
    pub resize_height: u32,

    pub threads: u16,

    pub include_deleted: bool,
    pub ignore_hash_check: bool,
    pub resize: bool,
    pub resume: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("directory", &self.directory)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("api_key", &"<redacted>")
            .field("pagination", &self.pagination)
            .field("extensions", &self.extensions)
            .field("resume", &self.resume)
            .finish_non_exhaustive()
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

fn nonzero(v: u64) -> Option<u64> {
    (v != 0).then_some(v)
}

impl Config {
    pub fn from_cli(args: DumpArgs) -> anyhow::Result<Self> {
        // -s and -e only bound the id walk.
        let end_id = if args.use_paging {
            None
        } else {
            nonzero(args.end_id)
        };
        let end_page = nonzero(args.end_page);

        let pagination = if args.use_paging {
            let start_page = args.start_page.unwrap_or(1);
            if start_page == 0 {
                bail!("--start-page must be at least 1");
            }
            if let Some(end) = end_page {
                if end < start_page {
                    bail!("--end-page ({end}) is before --start-page ({start_page})");
                }
            }
            Pagination::ByPage {
                start_page,
                query: args.query.unwrap_or_default(),
            }
        } else {
            if args.start_page.is_some() {
                bail!("--start-page requires --use-paging");
            }
            if args.query.is_some() {
                bail!("--query requires --use-paging; use --tags to narrow an id walk");
            }
            if let Some(end) = end_id {
                if end < args.start_id {
                    bail!("--end-id ({end}) is before --start-id ({})", args.start_id);
                }
            }
            Pagination::ById {
                start_id: args.start_id,
                tags: args.tags,
            }
        };

        let username = args
            .username
            .filter(|u| !u.trim().is_empty())
            .context("--username (or BOORU_USERNAME) is required")?;

        let extensions: Vec<String> = args
            .ext
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();

        if args.threads == 0 {
            bail!("--threads must be at least 1");
        }
        if args.retry_attempts == 0 {
            bail!("--retry-attempts must be at least 1");
        }
        if args.resize && (args.resize_width == 0 || args.resize_height == 0) {
            bail!("--resize-width and --resize-height must be non-zero");
        }

        Ok(Self {
            directory: expand_tilde(&args.path),
            base_url: args.base_url.trim_end_matches('/').to_string(),
            username,
            api_key: args.api_key.filter(|k| !k.is_empty()),
            pagination,
            extensions,
            end_id,
            end_page,
            retry_delay_secs: args.retry_delay,
            resize_threshold_kb: args.resize_threshold_kb,
            limit: args.limit,
            retry_attempts: args.retry_attempts,
            resize_width: args.resize_width,
            resize_height: args.resize_height,
            threads: args.threads,
            include_deleted: args.deleted,
            ignore_hash_check: args.ignore_hash_check,
            resize: args.resize,
            resume: args.resume,
            no_progress_bar: args.no_progress_bar,
        })
    }

    pub fn credentials(&self, api_key: String) -> Credentials {
        Credentials {
            login: self.username.clone(),
            api_key,
        }
    }

    pub fn to_dump_config(&self) -> DumpConfig {
        DumpConfig {
            output: self.directory.clone(),
            pagination: self.pagination.clone(),
            end_id: self.end_id,
            end_page: self.end_page,
            limit: self.limit,
            extensions: self.extensions.clone(),
            include_deleted: self.include_deleted,
            ignore_hash_check: self.ignore_hash_check,
            resize: self.resize.then(|| ResizeConfig {
                width: self.resize_width,
                height: self.resize_height,
                threshold_bytes: self.resize_threshold_kb.saturating_mul(1024),
            }),
            threads: usize::from(self.threads),
            retry: RetryConfig {
                max_attempts: self.retry_attempts,
                delay: Duration::from_secs(self.retry_delay_secs),
            },
            resume: self.resume,
            max_content_bytes: MAX_CONTENT_BYTES,
            no_progress_bar: self.no_progress_bar,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args(extra: &[&str]) -> DumpArgs {
        use clap::Parser;
        let mut argv = vec!["boorudl-rs", "dump", "out", "--username", "alice"];
        argv.extend_from_slice(extra);
        match crate::cli::Cli::try_parse_from(argv).unwrap().command {
            crate::cli::Command::Dump(d) => d,
            other => panic!("expected dump, got {other:?}"),
        }
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let result = expand_tilde("~/Pictures");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("Pictures"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(
            expand_tilde("/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            expand_tilde("relative/path"),
            PathBuf::from("relative/path")
        );
    }

    #[test]
    fn test_id_mode_defaults() {
        let cfg = Config::from_cli(make_args(&[])).unwrap();
        assert_eq!(
            cfg.pagination,
            Pagination::ById {
                start_id: 1,
                tags: String::new()
            }
        );
        assert_eq!(cfg.end_id, None);
        assert_eq!(cfg.end_page, None);
        assert_eq!(cfg.extensions, vec!["png", "jpg"]);
    }

    #[test]
    fn test_paging_mode() {
        let cfg = Config::from_cli(make_args(&[
            "-p",
            "--start-page",
            "2",
            "--end-page",
            "5",
            "--query",
            "blonde_hair",
        ]))
        .unwrap();
        assert_eq!(
            cfg.pagination,
            Pagination::ByPage {
                start_page: 2,
                query: "blonde_hair".into()
            }
        );
        assert_eq!(cfg.end_page, Some(5));
    }

    #[test]
    fn test_paging_mode_ignores_id_bounds() {
        let cfg = Config::from_cli(make_args(&["-p", "-s", "500", "-e", "10"])).unwrap();
        assert_eq!(cfg.end_id, None);
        assert!(matches!(cfg.pagination, Pagination::ByPage { start_page: 1, .. }));
        assert_eq!(cfg.to_dump_config().end_id, None);
    }

    #[test]
    fn test_paging_options_need_paging() {
        assert!(Config::from_cli(make_args(&["--start-page", "2"])).is_err());
        assert!(Config::from_cli(make_args(&["--query", "x"])).is_err());
    }

    #[test]
    fn test_end_page_allowed_in_id_mode() {
        let cfg = Config::from_cli(make_args(&["--end-page", "3"])).unwrap();
        assert_eq!(cfg.end_page, Some(3));
    }

    #[test]
    fn test_end_before_start_rejected() {
        assert!(Config::from_cli(make_args(&["-s", "100", "-e", "50"])).is_err());
        assert!(
            Config::from_cli(make_args(&["-p", "--start-page", "4", "--end-page", "2"])).is_err()
        );
        // zero means unlimited
        assert!(Config::from_cli(make_args(&["-s", "100", "-e", "0"])).is_ok());
    }

    #[test]
    fn test_username_required() {
        let mut args = make_args(&[]);
        args.username = None;
        assert!(Config::from_cli(args).is_err());
    }

    #[test]
    fn test_extensions_normalized() {
        let cfg = Config::from_cli(make_args(&["--ext", " PNG,.jpg,,webm"])).unwrap();
        assert_eq!(cfg.extensions, vec!["png", "jpg", "webm"]);
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let cfg = Config::from_cli(make_args(&["--api-key", "hunter2"])).unwrap();
        let out = format!("{cfg:?}");
        assert!(!out.contains("hunter2"));
        assert!(out.contains("<redacted>"));
    }

    #[test]
    fn test_to_dump_config() {
        let cfg = Config::from_cli(make_args(&[
            "--resize",
            "--resize-threshold-kb",
            "200",
            "--retry-attempts",
            "4",
            "--retry-delay",
            "0",
        ]))
        .unwrap();
        let dump = cfg.to_dump_config();
        assert_eq!(
            dump.resize,
            Some(ResizeConfig {
                width: 512,
                height: 512,
                threshold_bytes: 200 * 1024,
            })
        );
        assert_eq!(dump.retry.max_attempts, 4);
        assert_eq!(dump.retry.delay, Duration::ZERO);
        assert_eq!(dump.threads, 8);
        assert_eq!(dump.output, PathBuf::from("out"));
    }

    #[test]
    fn test_resize_disabled_by_default() {
        let cfg = Config::from_cli(make_args(&[])).unwrap();
        assert!(cfg.to_dump_config().resize.is_none());
    }
}
