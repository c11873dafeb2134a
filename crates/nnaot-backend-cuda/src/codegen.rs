use nnaot::backend::BackendResult;
use nnaot::ir::{BufferId, IrFunction};
use nnaot_backend_c::collect_kernels;
use nnaot_backend_c::kernels::{prelude, push_block, Dialect};

use crate::BACKEND;

/// One kernel launch of the program, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLaunch {
    pub name: String,
    pub node: String,
    /// Threads needed, one per work item.
    pub count: usize,
    /// Buffer bound to each kernel parameter.
    pub buffers: Vec<BufferId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CudaSource {
    pub source: String,
    pub launches: Vec<KernelLaunch>,
}

/// CUDA C for every compute instruction of `function`. Needs no device.
pub fn generate(function: &IrFunction) -> BackendResult<CudaSource> {
    let kernels = collect_kernels(BACKEND, function)?;
    let mut source = format!(
        "// Generated by nnaot from `{}`.\n",
        function.name().replace('\n', " ")
    );
    source.push_str(&prelude(Dialect::Cuda));
    source.push('\n');

    let mut launches = Vec::with_capacity(kernels.len());
    for kernel in kernels {
        let params = kernel
            .params
            .iter()
            .map(|param| param.declaration())
            .collect::<Vec<_>>()
            .join(", ");
        let mut body = String::new();
        push_block(&mut body, 1, &kernel.body);
        source.push_str(&format!(
            "// node `{node}`
extern \"C\" __global__ void {name}({params}) {{
  long long i = (long long)blockIdx.x * blockDim.x + threadIdx.x;
  if (i >= {count}) return;
{body}}}

",
            node = kernel.node.replace('\n', " "),
            name = kernel.name,
            count = kernel.count,
        ));
        launches.push(KernelLaunch {
            buffers: kernel.params.iter().map(|param| param.buffer).collect(),
            name: kernel.name,
            node: kernel.node,
            count: kernel.count,
        });
    }

    log::debug!(
        target: "nnaot::gpu",
        "generated {} kernels for `{}`",
        launches.len(),
        function.name()
    );
    Ok(CudaSource { source, launches })
}
