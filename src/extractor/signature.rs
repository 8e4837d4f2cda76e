// TubeSync - Video Stream Extraction and Download Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Signature decryption
//!
//! Some stream URLs carry an obfuscated `s` parameter. The player script ships
//! the routine that turns it into a usable signature. We recover that routine
//! with a handful of patterns and run it with a small evaluator instead of a
//! JavaScript engine.
//!
//! # Derivation
//! 1. Download the player script
//! 2. Find the transform name (`.sig||NAME(`)
//! 3. Extract `NAME=function(a){...}`
//! 4. Find the helper object it calls and extract `var HELPER={...}};`
//! 5. Synthesize `HELPER + FUNCTION + function decrypt(a){return NAME(a);}`
//! 6. Compile that into a [`SignatureProgram`]
//!
//! The transform body only ever splits the input into characters, applies
//! helper calls (reverse, splice from the front, swap first with index) and
//! joins it back, so that is all the evaluator supports. Anything else is a
//! decryption error.
//!
//! # Caching
//! The derived program is cached process-wide in [`SignatureDecryptor::global`].
//! Initialization goes through `tokio::sync::OnceCell`, so concurrent callers
//! arriving before the first derivation completes wait for that single
//! derivation instead of running their own. A failed derivation leaves the
//! cell empty and the next caller tries again.

use crate::error::{Result, TubeSyncError};
use crate::extractor::client::Downloader;
use crate::extractor::parser::match_group1;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info};

const DECRYPTION_FUNC_NAME: &str = "decrypt";

static GLOBAL_DECRYPTOR: Lazy<Arc<SignatureDecryptor>> =
    Lazy::new(|| Arc::new(SignatureDecryptor::new()));

lazy_static::lazy_static! {
    static ref HELPER_METHOD: Regex =
        Regex::new(r"([A-Za-z0-9_$]+):function\(([A-Za-z0-9_,]*)\)\{([^}]*)\}").unwrap();
    static ref FUNCTION_DEF: Regex =
        Regex::new(r"([A-Za-z0-9_$]+)=function\(([A-Za-z0-9_$]+)\)\{(.*?)\};").unwrap();
    static ref HELPER_DEF: Regex = Regex::new(r"^var ([A-Za-z0-9_$]+)=\{").unwrap();
    static ref CALLER_DEF: Regex = Regex::new(
        r"function ([A-Za-z0-9_$]+)\(([A-Za-z0-9_$]+)\)\{return ([A-Za-z0-9_$]+)\(([A-Za-z0-9_$]+)\);\}"
    )
    .unwrap();
    static ref HELPER_CALL: Regex = Regex::new(
        r#"^([A-Za-z0-9_$]+)(?:\.([A-Za-z0-9_$]+)|\["([A-Za-z0-9_$]+)"\])\(([A-Za-z0-9_$]+),(\d+)\)$"#
    )
    .unwrap();
}

/// One primitive applied to the character array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureOp {
    Reverse,
    /// Drop the first `n` characters
    Splice(usize),
    /// Swap the first character with the one at `n % len`
    Swap(usize),
}

/// Compiled transform, ready to evaluate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureProgram {
    ops: Vec<SignatureOp>,
}

impl SignatureProgram {
    /// Compile synthesized decryption code (helper object, transform, caller)
    pub fn compile(code: &str) -> Result<Self> {
        let helper_name = HELPER_DEF
            .captures(code)
            .map(|c| c[1].to_string())
            .ok_or_else(|| TubeSyncError::decryption("compile", "helper object missing"))?;

        let mut methods: HashMap<String, HelperKind> = HashMap::new();
        for caps in HELPER_METHOD.captures_iter(code) {
            let body = &caps[3];
            let kind = if body.contains("reverse") {
                HelperKind::Reverse
            } else if body.contains("splice") || body.contains("slice") {
                HelperKind::Splice
            } else if body.contains("length") {
                HelperKind::Swap
            } else {
                return Err(TubeSyncError::decryption(
                    "compile",
                    format!("unsupported helper body '{}'", body),
                ));
            };
            methods.insert(caps[1].to_string(), kind);
        }
        if methods.is_empty() {
            return Err(TubeSyncError::decryption("compile", "helper object has no methods"));
        }

        let caller = CALLER_DEF
            .captures(code)
            .ok_or_else(|| TubeSyncError::decryption("compile", "caller missing"))?;
        if &caller[1] != DECRYPTION_FUNC_NAME {
            return Err(TubeSyncError::decryption("compile", "caller has unexpected name"));
        }
        let transform_name = caller[3].to_string();

        let function = FUNCTION_DEF
            .captures_iter(code)
            .find(|c| c[1] == transform_name)
            .ok_or_else(|| {
                TubeSyncError::decryption("compile", format!("transform {} missing", transform_name))
            })?;
        let arg = function[2].to_string();
        let body = function[3].to_string();

        let mut ops = Vec::new();
        for statement in body.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            if statement == format!("{}={}.split(\"\")", arg, arg)
                || statement == format!("return {}.join(\"\")", arg)
            {
                continue;
            }

            let call = HELPER_CALL.captures(statement).ok_or_else(|| {
                TubeSyncError::decryption("compile", format!("unsupported statement '{}'", statement))
            })?;
            if call[1] != helper_name || call[4] != arg {
                return Err(TubeSyncError::decryption(
                    "compile",
                    format!("unexpected call '{}'", statement),
                ));
            }
            let method = call.get(2).or_else(|| call.get(3)).map(|m| m.as_str()).unwrap_or_default();
            let operand: usize = call[5]
                .parse()
                .map_err(|_| TubeSyncError::decryption("compile", "operand out of range"))?;

            let op = match methods.get(method) {
                Some(HelperKind::Reverse) => SignatureOp::Reverse,
                Some(HelperKind::Splice) => SignatureOp::Splice(operand),
                Some(HelperKind::Swap) => SignatureOp::Swap(operand),
                None => {
                    return Err(TubeSyncError::decryption(
                        "compile",
                        format!("unknown helper method {}", method),
                    ))
                }
            };
            ops.push(op);
        }

        Ok(Self { ops })
    }

    pub fn ops(&self) -> &[SignatureOp] {
        &self.ops
    }

    /// Run the transform on an encrypted signature
    pub fn evaluate(&self, input: &str) -> String {
        let mut chars: Vec<char> = input.chars().collect();
        for op in &self.ops {
            match *op {
                SignatureOp::Reverse => chars.reverse(),
                SignatureOp::Splice(n) => {
                    let n = n.min(chars.len());
                    chars.drain(..n);
                }
                SignatureOp::Swap(n) => {
                    if !chars.is_empty() {
                        let len = chars.len();
                        chars.swap(0, n % len);
                    }
                }
            }
        }
        chars.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum HelperKind {
    Reverse,
    Splice,
    Swap,
}

/// Extract the decryption code from a player script
///
/// Returns helper object, transform function and caller concatenated.
pub fn extract_decryption_code(player_code: &str) -> Result<String> {
    let func_name = match_group1(r"\.sig\|\|([a-zA-Z0-9$]+)\(", player_code)
        .map_err(|e| TubeSyncError::decryption("function name", e.to_string()))?;

    let function_pattern = format!(
        r"({}=function\([a-zA-Z0-9_]*\)\{{.+?\}})",
        regex::escape(&func_name)
    );
    let function = match_group1(&function_pattern, player_code)
        .map_err(|e| TubeSyncError::decryption("function body", e.to_string()))?;
    let function = format!("var {};", function);

    let helper_name = match_group1(r";([A-Za-z0-9_\$]{2})\...\(", &function)
        .map_err(|e| TubeSyncError::decryption("helper name", e.to_string()))?;

    let helper_pattern = format!(r"(var {}=\{{.+?\}}\}};)", regex::escape(&helper_name));
    let helper = match_group1(&helper_pattern, player_code)
        .map_err(|e| TubeSyncError::decryption("helper object", e.to_string()))?;

    let caller = format!(
        "function {}(a){{return {}(a);}}",
        DECRYPTION_FUNC_NAME, func_name
    );
    Ok(format!("{}{}{}", helper, function, caller))
}

/// Lazily derived, shared signature transform
#[derive(Debug, Default)]
pub struct SignatureDecryptor {
    program: OnceCell<Arc<SignatureProgram>>,
}

impl SignatureDecryptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance
    pub fn global() -> Arc<SignatureDecryptor> {
        Arc::clone(&GLOBAL_DECRYPTOR)
    }

    pub fn is_initialized(&self) -> bool {
        self.program.initialized()
    }

    /// Get the cached program, deriving it from `player_url` on first use
    pub async fn program(
        &self,
        player_url: &str,
        downloader: &dyn Downloader,
    ) -> Result<Arc<SignatureProgram>> {
        let program = self
            .program
            .get_or_try_init(|| async {
                let derived = derive_program(player_url, downloader).await;
                match &derived {
                    Ok(program) => info!(player_url, ops = program.ops.len(), "derived signature transform"),
                    Err(e) => error!(target: "tubesync::decryption", player_url, error = %e, "could not derive signature transform"),
                }
                derived.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(program))
    }

    /// Decrypt one signature
    pub async fn decrypt(
        &self,
        player_url: &str,
        downloader: &dyn Downloader,
        encrypted: &str,
    ) -> Result<String> {
        let program = self.program(player_url, downloader).await?;
        Ok(program.evaluate(encrypted))
    }
}

async fn derive_program(player_url: &str, downloader: &dyn Downloader) -> Result<SignatureProgram> {
    if player_url.is_empty() {
        return Err(TubeSyncError::decryption("download", "no player url"));
    }
    let player_code = downloader
        .download(player_url)
        .await
        .map_err(|e| TubeSyncError::decryption("download", e.to_string()))?;
    let code = extract_decryption_code(&player_code)?;
    SignatureProgram::compile(&code)
}
