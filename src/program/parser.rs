//! Semantic annotation scanner
//!
//! Kernel parameters carry a trailing `:NAME` annotation telling the runtime
//! which variable to bind; `:NAME#` additionally marks the parameter whose
//! element count sets the default launch width:
//!
//! ```text
//! __kernel void add(__global const float* a :A, __global float* b :B#)
//! ```
//!
//! The compiler has no notion of these annotations, so they are cut out of
//! the source. The scanner is a plain byte walk over the parameter list: any
//! `:` inside the list starts an annotation, including one inside a comment.

use crate::error::{Result, RuntimeError, fail};

const KERNEL_KEYWORD: &str = "__kernel";

/// Kernel entry point recovered from annotated source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSignature {
    pub name: String,
    /// One entry per parameter, empty for unannotated parameters
    pub semantics: Vec<String>,
    /// Semantic whose element count is the default global size
    pub parallel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSource {
    /// Source with annotations removed
    pub source: String,
    /// `None` for helper code without a kernel
    pub kernel: Option<KernelSignature>,
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Strip annotations from `source` and describe its kernel, if any
///
/// Only the first `__kernel` of the source is examined.
pub fn parse(module: &str, source: &str) -> Result<ParsedSource> {
    let Some(keyword) = source.find(KERNEL_KEYWORD) else {
        return Ok(ParsedSource {
            source: source.to_string(),
            kernel: None,
        });
    };
    let bytes = source.as_bytes();
    let malformed = || RuntimeError::MalformedKernel {
        name: module.to_string(),
    };

    let Some(open) = source[keyword..].find('(').map(|p| keyword + p) else {
        return fail(malformed());
    };

    // identifier right before the parameter list
    let mut name_end = open;
    while name_end > keyword && !is_ident(bytes[name_end - 1]) {
        name_end -= 1;
    }
    let mut name_start = name_end;
    while name_start > keyword && is_ident(bytes[name_start - 1]) {
        name_start -= 1;
    }
    let name = &source[name_start..name_end];
    if name.is_empty() || name == KERNEL_KEYWORD {
        return fail(malformed());
    }

    let params_end = source[open..].find(')').map_or(source.len(), |p| open + p);
    let params = source[open + 1..params_end].trim();
    let mut semantics = Vec::new();
    if !params.is_empty() && params != "void" {
        semantics.push(String::new());
    }
    let mut parallel = None;

    let mut out = String::with_capacity(source.len());
    out.push_str(&source[..=open]);
    let mut copied = open + 1;
    let mut pos = open + 1;
    while pos < bytes.len() && bytes[pos] != b')' {
        match bytes[pos] {
            b',' => {
                semantics.push(String::new());
                pos += 1;
            }
            b':' => {
                let colon = pos;
                while pos < bytes.len() && !is_ident(bytes[pos]) {
                    pos += 1;
                }
                let word_start = pos;
                while pos < bytes.len() && is_ident(bytes[pos]) {
                    pos += 1;
                }
                let word = &source[word_start..pos];
                if bytes.get(pos) == Some(&b'#') {
                    parallel = Some(word.to_string());
                    pos += 1;
                }
                match semantics.last_mut() {
                    Some(slot) => *slot = word.to_string(),
                    None => semantics.push(word.to_string()),
                }
                out.push_str(&source[copied..colon]);
                copied = pos;
            }
            _ => pos += 1,
        }
    }
    out.push_str(&source[copied..]);

    let parallel = parallel.or_else(|| semantics.first().filter(|s| !s.is_empty()).cloned());
    tracing::debug!(
        "Kernel `{}` in `{}` takes {:?}",
        name,
        module,
        semantics
    );
    Ok(ParsedSource {
        source: out,
        kernel: Some(KernelSignature {
            name: name.to_string(),
            semantics,
            parallel,
        }),
    })
}
