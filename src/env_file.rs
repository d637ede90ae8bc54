//! `.env` support: `--env-file <path>` on the command line, otherwise `./.env` if present.
//! Variables already set in the process environment win over file values.

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct LoadedEnvFile {
    pub path: PathBuf,
    pub explicit: bool,
}

/// Parses the command line and loads the selected env file, if any.
pub fn load_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    let args = std::env::args_os()
        .skip(1)
        .map(|a| a.into_string().map_err(|_| "argument contains invalid UTF-8".to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    match env_file_arg(&args)? {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file not found: {}", path.display()));
            }
            apply(&path)?;
            Ok(Some(LoadedEnvFile { path, explicit: true }))
        }
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let path = cwd.join(".env");
            if !path.is_file() {
                return Ok(None);
            }
            apply(&path)?;
            Ok(Some(LoadedEnvFile { path, explicit: false }))
        }
    }
}

fn env_file_arg(args: &[String]) -> Result<Option<PathBuf>, String> {
    let mut found: Option<PathBuf> = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let value = if arg == "--env-file" {
            iter.next().cloned()
        } else if let Some(v) = arg.strip_prefix("--env-file=") {
            Some(v.to_string())
        } else if arg == "--" {
            break;
        } else {
            return Err(format!("unrecognised argument: {}", arg));
        };
        let value = value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
        if found.replace(PathBuf::from(value)).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(found)
}

fn apply(path: &Path) -> Result<(), String> {
    let text = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in text.lines().enumerate() {
        let Some((key, value)) = parse_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        if std::env::var_os(&key).is_none() {
            // SAFETY: called from main before any other thread is spawned.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// `KEY=value`, `export KEY=value`, quoted values and trailing `#` comments.
pub fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.contains(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }
    Ok(Some((key.to_string(), parse_value(raw.trim())?)))
}

fn parse_value(raw: &str) -> Result<String, String> {
    let mut chars = raw.chars();
    let quote = match chars.next() {
        Some(q @ ('"' | '\'')) => q,
        _ => return Ok(raw.split('#').next().unwrap_or_default().trim_end().to_string()),
    };

    let mut out = String::new();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if quote == '"' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => return Err("unterminated escape sequence in double-quoted value".to_string()),
            },
            c if c == quote => {
                let rest = chars.as_str().trim();
                if rest.is_empty() || rest.starts_with('#') {
                    return Ok(out);
                }
                return Err("unexpected characters after closing quote".to_string());
            }
            c => out.push(c),
        }
    }
    Err("unterminated quoted value".to_string())
}
