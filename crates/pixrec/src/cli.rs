use std::path::PathBuf;

use pixcanvas::Rect;

pub(crate) const DEFAULT_SIMULATE_SECONDS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Help,
    List {
        name: String,
    },
    Inspect {
        path: PathBuf,
    },
    Snapshot {
        name: String,
        at_ms: u64,
        rect: Option<Rect>,
        out: PathBuf,
    },
    Simulate {
        name: String,
        seconds: u64,
        rect: Option<Rect>,
    },
}

pub(crate) fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some(command) = args.first() else {
        return Err(usage_text());
    };
    let rest = &args[1..];

    match command.as_str() {
        "-h" | "--help" | "help" => Ok(Command::Help),
        "list" => {
            let [name] = rest else {
                return Err("list requires exactly one connection name".to_string());
            };
            Ok(Command::List { name: name.clone() })
        }
        "inspect" => {
            let [path] = rest else {
                return Err("inspect requires exactly one recording file".to_string());
            };
            Ok(Command::Inspect {
                path: PathBuf::from(path),
            })
        }
        "snapshot" => {
            let (name, options) = split_name("snapshot", rest)?;
            let mut at_ms = 0u64;
            let mut rect = None;
            let mut out = None;
            let mut index = 0usize;
            while index < options.len() {
                let flag = options[index].as_str();
                let value = flag_value(options, index)?;
                match flag {
                    "--at-ms" => {
                        at_ms = value
                            .parse::<u64>()
                            .map_err(|_| format!("invalid --at-ms value '{value}' (expected u64)"))?;
                    }
                    "--rect" => rect = Some(parse_rect(value)?),
                    "--out" => out = Some(PathBuf::from(value)),
                    other => return Err(format!("unknown snapshot argument '{other}'")),
                }
                index += 2;
            }
            let out = out.ok_or_else(|| "snapshot requires --out <file.png>".to_string())?;
            Ok(Command::Snapshot {
                name,
                at_ms,
                rect,
                out,
            })
        }
        "simulate" => {
            let (name, options) = split_name("simulate", rest)?;
            let mut seconds = DEFAULT_SIMULATE_SECONDS;
            let mut rect = None;
            let mut index = 0usize;
            while index < options.len() {
                let flag = options[index].as_str();
                let value = flag_value(options, index)?;
                match flag {
                    "--seconds" => {
                        seconds = value
                            .parse::<u64>()
                            .map_err(|_| format!("invalid --seconds value '{value}' (expected u64)"))?;
                    }
                    "--rect" => rect = Some(parse_rect(value)?),
                    other => return Err(format!("unknown simulate argument '{other}'")),
                }
                index += 2;
            }
            Ok(Command::Simulate { name, seconds, rect })
        }
        other => Err(format!("unknown subcommand '{other}'")),
    }
}

fn split_name<'a>(command: &str, rest: &'a [String]) -> Result<(String, &'a [String]), String> {
    match rest.split_first() {
        Some((name, options)) if !name.starts_with("--") => Ok((name.clone(), options)),
        _ => Err(format!("{command} requires a connection name")),
    }
}

fn flag_value(options: &[String], index: usize) -> Result<&str, String> {
    options
        .get(index + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("missing value for {}", options[index]))
}

/// Parses `x,y,width,height`.
pub(crate) fn parse_rect(value: &str) -> Result<Rect, String> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<i32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| format!("invalid rectangle '{value}' (expected x,y,width,height)"))?;
    let [x, y, width, height] = parts[..] else {
        return Err(format!("invalid rectangle '{value}' (expected x,y,width,height)"));
    };
    if width <= 0 || height <= 0 {
        return Err(format!("rectangle '{value}' must have a positive size"));
    }
    Ok(Rect::from_origin_size(x, y, width, height))
}

pub(crate) fn usage_text() -> String {
    [
        "pixrec - record and replay chunked pixel canvases",
        "",
        "Usage:",
        "  pixrec list <name>",
        "  pixrec inspect <file.pixrec>",
        "  pixrec snapshot <name> [--at-ms <u64>] [--rect x,y,w,h] --out <file.png>",
        "  pixrec simulate <name> [--seconds <u64>] [--rect x,y,w,h]",
        "",
        "Environment:",
        "  PIXREC_ROOT  data directory holding pixrec.json and recordings/ (default: current directory)",
        "  RUST_LOG     log filter (default: info)",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parses_snapshot_flags() {
        let command = parse_args(&args(&[
            "snapshot", "world", "--at-ms", "1500", "--rect", "-10,20,30,40", "--out", "shot.png",
        ]))
        .expect("parse");
        assert_eq!(
            command,
            Command::Snapshot {
                name: "world".to_string(),
                at_ms: 1500,
                rect: Some(Rect::new(-10, 20, 20, 60)),
                out: PathBuf::from("shot.png"),
            }
        );
    }

    #[test]
    fn simulate_defaults_duration() {
        let command = parse_args(&args(&["simulate", "world"])).expect("parse");
        assert_eq!(
            command,
            Command::Simulate {
                name: "world".to_string(),
                seconds: DEFAULT_SIMULATE_SECONDS,
                rect: None,
            }
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&[]).is_err());
        assert!(parse_args(&args(&["list"])).is_err());
        assert!(parse_args(&args(&["snapshot", "world"])).is_err());
        assert!(parse_args(&args(&["snapshot", "--out", "x.png"])).is_err());
        assert!(parse_args(&args(&["simulate", "world", "--seconds"])).is_err());
        assert!(parse_args(&args(&["frobnicate"])).is_err());
        assert!(parse_rect("1,2,3").is_err());
        assert!(parse_rect("1,2,0,4").is_err());
    }
}
