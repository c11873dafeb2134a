use nnaot::backend::BackendResult;
use nnaot::ir::{IrFunction, Location, ARENA_ALIGNMENT};

use crate::kernels::{emit_kernel, prelude, push_block, Dialect, ElementKernel};

const BACKEND: &str = "native";

/// Generated C translation unit for one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CModule {
    /// Name of the exported entry point.
    pub symbol: String,
    pub source: String,
    pub header: String,
}

/// C identifier derived from an arbitrary name.
pub fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

pub fn entry_symbol(function: &IrFunction) -> String {
    format!("nnaot_{}", sanitize(function.name()))
}

/// Host expression for the storage of a kernel parameter inside the entry
/// point, where `weights` and `activations` are in scope.
pub(crate) fn storage_expr(
    function: &IrFunction,
    buffer: nnaot::ir::BufferId,
    ctype: &str,
) -> Option<String> {
    match function.location(buffer)? {
        Location::Weight(index) => Some(format!("({ctype}*)weights[{index}]")),
        Location::Activation { offset } => Some(format!("({ctype}*)(activations + {offset})")),
    }
}

/// Compute kernels of `function`, in program order.
pub fn collect_kernels(backend: &str, function: &IrFunction) -> BackendResult<Vec<ElementKernel>> {
    let mut kernels = Vec::new();
    for (position, instr) in function.instructions().iter().enumerate() {
        if let Some(kernel) = emit_kernel(backend, function, position, instr)? {
            kernels.push(kernel);
        }
    }
    Ok(kernels)
}

pub fn generate(function: &IrFunction) -> BackendResult<CModule> {
    let symbol = entry_symbol(function);
    let kernels = collect_kernels(BACKEND, function)?;

    let mut source = format!(
        "/* Generated by nnaot from `{}`. */\n",
        function.name().replace("*/", "* /")
    );
    source.push_str(&prelude(Dialect::C));
    source.push('\n');

    for kernel in &kernels {
        let params = kernel
            .params
            .iter()
            .map(|param| param.declaration())
            .collect::<Vec<_>>()
            .join(", ");
        let mut body = String::new();
        push_block(&mut body, 2, &kernel.body);
        let block = format!(
            "/* node `{node}` */
static void {name}({params}) {{
  for (long long i = 0; i < {count}; ++i) {{
{body}  }}
}}

",
            node = kernel.node.replace("*/", "* /"),
            name = kernel.name,
            count = kernel.count,
        );
        source.push_str(&block);
    }

    source.push_str(&format!(
        "int {symbol}(uint8_t* const* weights, uint8_t* activations) {{\n  (void)weights;\n  (void)activations;\n"
    ));
    for kernel in &kernels {
        let args = kernel
            .params
            .iter()
            .map(|param| {
                storage_expr(function, param.buffer, param.ctype).ok_or_else(|| {
                    nnaot::backend::BackendError::unsupported(
                        BACKEND,
                        kernel.name.clone(),
                        kernel.node.clone(),
                        format!("buffer {} has no storage", param.buffer.index()),
                    )
                })
            })
            .collect::<BackendResult<Vec<_>>>()?
            .join(", ");
        source.push_str(&format!("  {}({args});\n", kernel.name));
    }
    source.push_str("  return 0;\n}\n");

    let header = header(function, &symbol);
    log::debug!(
        target: "nnaot::native",
        "generated `{symbol}`: {} kernels, {} source bytes",
        kernels.len(),
        source.len()
    );
    Ok(CModule {
        symbol,
        source,
        header,
    })
}

fn header(function: &IrFunction, symbol: &str) -> String {
    let prefix = sanitize(function.name()).to_ascii_uppercase();
    let mut out = format!(
        "#ifndef NNAOT_{prefix}_H
#define NNAOT_{prefix}_H

#include <stdint.h>

#define {prefix}_ACTIVATION_BYTES {}
#define {prefix}_ALIGNMENT {ARENA_ALIGNMENT}
#define {prefix}_NUM_WEIGHTS {}
",
        function.memory().activation_bytes,
        function.weights().len()
    );
    for (index, weight) in function.weights().iter().enumerate() {
        out.push_str(&format!(
            "#define {prefix}_WEIGHT_{} {index} /* {} {} */\n",
            sanitize(&weight.name).to_ascii_uppercase(),
            weight.role.as_str(),
            weight.ty
        ));
    }
    out.push_str(&format!(
        "
/* weights[i] points at weight i; activations at {prefix}_ACTIVATION_BYTES
   bytes aligned to {prefix}_ALIGNMENT. Returns 0 on success. */
int {symbol}(uint8_t* const* weights, uint8_t* activations);

#endif
"
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_produces_identifiers() {
        assert_eq!(sanitize("mnist-net.v2"), "mnist_net_v2");
        assert_eq!(sanitize("3layer"), "_3layer");
        assert_eq!(sanitize(""), "_");
    }
}
