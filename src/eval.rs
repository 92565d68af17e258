//! The evaluator seam.
//!
//! Workers drive the `nix` command-line evaluator: one `nix eval --json`
//! invocation per job. The generated expression walks the accessor path
//! from the root value, forces the result, classifies it, and returns a
//! single JSON document describing either the derivations found there, the
//! node's children, or an unsupported kind. Keeping the evaluator in a
//! child of the worker means a restarted worker loses nothing but cache
//! warmth; it re-walks incoming paths from scratch.

use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::accessor::{Accessor, AccessorPath};
use crate::error::{DrvStreamError, Result};
use crate::job::{Drv, Job};

/// How to reach and evaluate the top-level expression.
#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Filesystem path to a Nix file, or a flake URI with optional
    /// `#fragment` when `flake` is set.
    pub expr: String,
    pub flake: bool,
    pub impure: bool,
    pub show_trace: bool,
    /// Include the derivation `meta` attribute in results.
    pub want_meta: bool,
}

impl EvalConfig {
    /// Pure evaluation applies to flakes unless `--impure` was given.
    pub fn pure_eval(&self) -> bool {
        self.flake && !self.impure
    }
}

/// Handle on the external evaluator.
pub struct Evaluator {
    config: EvalConfig,
}

impl Evaluator {
    /// Open the evaluator: verify the store is reachable. Failure here is
    /// fatal for the worker.
    pub fn open(config: EvalConfig) -> Result<Self> {
        let output = nix_command(&["store", "ping", "--json"])
            .output()
            .map_err(|e| DrvStreamError::Worker(format!("could not run nix: {}", e)))?;
        if !output.status.success() {
            return Err(DrvStreamError::Worker(format!(
                "could not open store: {}",
                filter_ansi(String::from_utf8_lossy(&output.stderr).trim())
            )));
        }
        debug!("store reachable");
        Ok(Self { config })
    }

    /// Walk `path` from the root value and classify the node found there.
    /// `None` means the node is null, which surfaces neither results nor an
    /// error.
    pub fn walk(&self, path: &AccessorPath) -> Result<Option<Job>> {
        let expr = walk_expr(&self.config, path);
        trace!(%path, "walking");

        let mut cmd = nix_command(&["eval", "--json", "--expr", &expr]);
        if !self.config.pure_eval() {
            cmd.arg("--impure");
        }
        if self.config.show_trace {
            cmd.arg("--show-trace");
        }

        let output = cmd
            .output()
            .map_err(|e| DrvStreamError::Worker(format!("could not run nix: {}", e)))?;

        if !output.status.success() {
            let stderr = filter_ansi(String::from_utf8_lossy(&output.stderr).trim());
            return Err(DrvStreamError::Eval(stderr));
        }

        let walked: WalkOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            DrvStreamError::Eval(format!("unintelligible evaluator output: {}", e))
        })?;
        classify(walked, path)
    }
}

/// A `nix` invocation with the evaluation environment pinned down:
/// `NIX_PATH` removed so no undeclared dependencies sneak in, and the
/// conservative collector disabled since workers are recycled wholesale.
fn nix_command(args: &[&str]) -> Command {
    let mut cmd = Command::new("nix");
    cmd.args(["--extra-experimental-features", "nix-command flakes"]);
    cmd.args(args);
    cmd.env_remove("NIX_PATH");
    cmd.env("GC_DONT_GC", "1");
    cmd
}

/// The classified node as reported by the generated expression.
#[derive(Debug, Deserialize)]
struct WalkOutput {
    kind: String,
    #[serde(default)]
    drvs: Vec<Drv>,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    length: usize,
}

fn classify(walked: WalkOutput, path: &AccessorPath) -> Result<Option<Job>> {
    match walked.kind.as_str() {
        "drvs" => {
            let drvs = walked
                .drvs
                .into_iter()
                .map(Drv::validate)
                .collect::<Result<Vec<_>>>()?;
            Ok(Some(Job::Drvs(drvs)))
        }
        "attrs" => {
            let mut names = walked.names;
            names.sort_unstable();
            Ok(Some(Job::Attrs(names)))
        }
        "list" => Ok(Some(Job::List(walked.length))),
        "null" => Ok(None),
        other => Err(DrvStreamError::Type(format!(
            "value at {} is of type '{}', which is not supported",
            if path.is_root() {
                "the root".to_string()
            } else {
                path.to_string()
            },
            other
        ))),
    }
}

/// Quote a string as a Nix string literal.
fn nix_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '$' if chars.peek() == Some(&'{') => out.push_str("\\$"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// The root value as a Nix expression.
fn root_expr(config: &EvalConfig) -> String {
    if config.flake {
        let (flake_ref, fragment) = match config.expr.split_once('#') {
            Some((r, f)) => (r, f),
            None => (config.expr.as_str(), ""),
        };
        let mut expr = format!("(builtins.getFlake {}).outputs", nix_str(flake_ref));
        for part in fragment.split('.').filter(|p| !p.is_empty()) {
            expr.push_str(&format!(".${{{}}}", nix_str(part)));
        }
        expr
    } else {
        let path = PathBuf::from(&config.expr);
        let absolute = if path.is_absolute() {
            path
        } else {
            std::env::current_dir().unwrap_or_default().join(path)
        };
        format!("import (/. + {})", nix_str(&absolute.to_string_lossy()))
    }
}

/// The accessor path as a Nix list literal.
fn path_literal(path: &AccessorPath) -> String {
    let mut out = String::from("[");
    for accessor in path.accessors() {
        out.push(' ');
        match accessor {
            Accessor::Index(i) => out.push_str(&i.to_string()),
            Accessor::Name(n) => out.push_str(&nix_str(n)),
        }
    }
    out.push_str(" ]");
    out
}

/// Generate the walk-and-classify expression for one job.
fn walk_expr(config: &EvalConfig, path: &AccessorPath) -> String {
    let meta_field = if config.want_meta {
        "{ meta = sanitizeMeta (d.meta or { }); }"
    } else {
        "{ }"
    };
    format!(
        r#"let
  autocall = v: if builtins.isFunction v then v {{ }} else v;
  step = acc: a:
    let w = autocall acc; in
    if builtins.isInt a then
      (if builtins.isList w then
         (if a < builtins.length w then builtins.elemAt w a
          else throw "list index ${{toString a}} out of range")
       else throw "expected a list at index ${{toString a}}, got a ${{builtins.typeOf w}}")
    else
      (if builtins.isAttrs w then
         (if builtins.hasAttr a w then builtins.getAttr a w
          else throw "attribute '${{a}}' not found")
       else throw "expected an attribute set at '${{a}}', got a ${{builtins.typeOf w}}");
  isDrv = x: builtins.isAttrs x && (x.type or null) == "derivation";
  collectDrvs = x:
    if isDrv x then [ x ]
    else if builtins.isAttrs x && (x.recurseForDerivations or false) == true then
      builtins.concatMap collectDrvs
        (map (n: builtins.getAttr n x)
          (builtins.filter (n: n != "recurseForDerivations") (builtins.attrNames x)))
    else [ ];
  sanitizeMeta = m:
    builtins.listToAttrs (builtins.concatMap
      (n: let r = builtins.tryEval (builtins.toJSON m.${{n}});
          in if r.success then [ {{ name = n; value = builtins.fromJSON r.value; }} ] else [ ])
      (builtins.attrNames m));
  describeDrv = d:
    {{
      name = d.name or "";
      system = d.system or "unknown";
      drvPath = d.drvPath;
      outputs = builtins.listToAttrs
        (map (o: {{ name = o; value = d.${{o}}.outPath; }})
          (builtins.filter (o: builtins.hasAttr o d) (d.outputs or [ "out" ])));
    }} // {meta_field};
  root = autocall ({root});
  v = autocall (builtins.foldl' step root {path});
  drvs = collectDrvs v;
in
if drvs != [ ] then {{ kind = "drvs"; drvs = map describeDrv drvs; }}
else if builtins.isAttrs v then {{ kind = "attrs"; names = builtins.attrNames v; }}
else if builtins.isList v then {{ kind = "list"; length = builtins.length v; }}
else if v == null then {{ kind = "null"; }}
else {{ kind = builtins.typeOf v; }}"#,
        meta_field = meta_field,
        root = root_expr(config),
        path = path_literal(path),
    )
}

/// Strip ANSI escape sequences and carriage returns from evaluator
/// diagnostics before they go into an error frame.
pub fn filter_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.peek() {
                // CSI: consume parameters until a final byte in @..~.
                Some('[') => {
                    chars.next();
                    for c in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&c) {
                            break;
                        }
                    }
                }
                // OSC: consume until BEL or ST.
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' {
                            chars.next();
                            break;
                        }
                    }
                }
                // Two-character sequence.
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\r' => {}
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config() -> EvalConfig {
        EvalConfig {
            expr: "/src/release.nix".into(),
            flake: false,
            impure: false,
            show_trace: false,
            want_meta: false,
        }
    }

    #[test]
    fn purity_follows_flake_mode() {
        let mut c = config();
        assert!(!c.pure_eval());
        c.flake = true;
        assert!(c.pure_eval());
        c.impure = true;
        assert!(!c.pure_eval());
    }

    #[test]
    fn nix_str_escaping() {
        assert_eq!(nix_str("plain"), r#""plain""#);
        assert_eq!(nix_str(r#"a"b"#), r#""a\"b""#);
        assert_eq!(nix_str(r"a\b"), r#""a\\b""#);
        assert_eq!(nix_str("a${b}"), r#""a\${b}""#);
        assert_eq!(nix_str("a\nb"), r#""a\nb""#);
        // A dollar not followed by a brace is left alone.
        assert_eq!(nix_str("a$b"), r#""a$b""#);
    }

    #[test]
    fn root_expr_for_files() {
        assert_eq!(
            root_expr(&config()),
            r#"import (/. + "/src/release.nix")"#
        );
    }

    #[test]
    fn root_expr_for_flakes() {
        let c = EvalConfig {
            expr: "github:owner/repo#hydraJobs.release".into(),
            flake: true,
            ..config()
        };
        assert_eq!(
            root_expr(&c),
            r#"(builtins.getFlake "github:owner/repo").outputs.${"hydraJobs"}.${"release"}"#
        );
    }

    #[test]
    fn root_expr_for_flake_without_fragment() {
        let c = EvalConfig {
            expr: "github:owner/repo".into(),
            flake: true,
            ..config()
        };
        assert_eq!(
            root_expr(&c),
            r#"(builtins.getFlake "github:owner/repo").outputs"#
        );
    }

    #[test]
    fn path_literal_mixes_names_and_indices() {
        let path = AccessorPath::parse(r#"["a",3,"b c"]"#).unwrap();
        assert_eq!(path_literal(&path), r#"[ "a" 3 "b c" ]"#);
        assert_eq!(path_literal(&AccessorPath::root()), "[ ]");
    }

    #[test]
    fn walk_expr_embeds_path_and_meta_choice() {
        let path = AccessorPath::parse(r#"["pkgs"]"#).unwrap();
        let expr = walk_expr(&config(), &path);
        assert!(expr.contains(r#"builtins.foldl' step root [ "pkgs" ]"#));
        assert!(expr.contains("recurseForDerivations"));
        assert!(!expr.contains("sanitizeMeta (d.meta"));

        let with_meta = EvalConfig {
            want_meta: true,
            ..config()
        };
        assert!(walk_expr(&with_meta, &path).contains("sanitizeMeta (d.meta"));
    }

    fn walked(kind: &str) -> WalkOutput {
        WalkOutput {
            kind: kind.into(),
            drvs: Vec::new(),
            names: Vec::new(),
            length: 0,
        }
    }

    #[test]
    fn classify_attrs_sorts_names() {
        let mut w = walked("attrs");
        w.names = vec!["zlib".into(), "acl".into()];
        match classify(w, &AccessorPath::root()).unwrap() {
            Some(Job::Attrs(names)) => assert_eq!(names, vec!["acl", "zlib"]),
            other => panic!("expected attrs job, got {:?}", other),
        }
    }

    #[test]
    fn classify_list_and_null() {
        let mut w = walked("list");
        w.length = 4;
        assert_eq!(
            classify(w, &AccessorPath::root()).unwrap(),
            Some(Job::List(4))
        );
        assert_eq!(classify(walked("null"), &AccessorPath::root()).unwrap(), None);
    }

    #[test]
    fn classify_rejects_unsupported_kind() {
        let path = AccessorPath::parse(r#"["a"]"#).unwrap();
        let err = classify(walked("string"), &path).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("string"));
        assert!(msg.contains(r#""a""#));
    }

    #[test]
    fn classify_rejects_unknown_system() {
        let mut w = walked("drvs");
        w.drvs = vec![Drv {
            name: "bad".into(),
            system: "unknown".into(),
            drv_path: "/nix/store/abc-bad.drv".into(),
            outputs: BTreeMap::new(),
            meta: None,
        }];
        assert!(classify(w, &AccessorPath::root()).is_err());
    }

    #[test]
    fn walk_output_parses_evaluator_json() {
        let json = r#"{"kind":"drvs","drvs":[{"name":"hello","system":"x86_64-linux",
            "drvPath":"/nix/store/abc-hello.drv","outputs":{"out":"/nix/store/abc-hello"}}]}"#;
        let w: WalkOutput = serde_json::from_str(json).unwrap();
        assert_eq!(w.kind, "drvs");
        assert_eq!(w.drvs.len(), 1);
        assert_eq!(w.drvs[0].name, "hello");
    }

    #[test]
    fn ansi_filtering() {
        assert_eq!(filter_ansi("plain text"), "plain text");
        assert_eq!(filter_ansi("\x1b[31merror:\x1b[0m boom"), "error: boom");
        assert_eq!(filter_ansi("a\r\nb"), "a\nb");
        assert_eq!(filter_ansi("\x1b]0;title\x07rest"), "rest");
        // Trailing escape with nothing after it.
        assert_eq!(filter_ansi("x\x1b"), "x");
    }
}
