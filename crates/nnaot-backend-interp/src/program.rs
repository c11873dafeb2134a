use nnaot::backend::{
    BackendError, BackendKind, BackendResult, CompilationMode, CompiledFunction, IoBindings,
};
use nnaot::ir::{Instruction, IrFunction, Location, WeightRole};
use nnaot::tensor::{Tensor, Type};

use crate::dispatch::{key_operand, lookup, ElemClass, Kernel};
use crate::memory::{Memory, Operand, Place};

const BACKEND: &str = "interpreter";

/// One instruction with its kernel and resolved operands, destination first.
pub(crate) struct Step {
    pub instr: Instruction,
    pub operands: Vec<Operand>,
    kernel: Kernel,
}

/// A weight the caller exchanges through [`IoBindings`].
struct Binding {
    index: usize,
    name: String,
    ty: Type,
    role: WeightRole,
}

pub struct InterpretedFunction {
    mode: CompilationMode,
    steps: Vec<Step>,
    bindings: Vec<Binding>,
    memory: Memory,
}

pub(crate) fn compile(
    function: &IrFunction,
    mode: CompilationMode,
    poison: bool,
) -> BackendResult<InterpretedFunction> {
    let mut steps = Vec::with_capacity(function.instructions().len());
    for instr in function.instructions() {
        let operands = instr
            .operands()
            .iter()
            .map(|(id, _)| resolve(function, instr, *id))
            .collect::<BackendResult<Vec<_>>>()?;
        let key = operands.get(key_operand(&instr.kind)).ok_or_else(|| {
            BackendError::unsupported(BACKEND, instr.name(), &instr.node, "missing key operand")
        })?;
        let kernel = lookup(instr.name(), ElemClass::of(key.elem())).ok_or_else(|| {
            BackendError::unsupported(
                BACKEND,
                instr.name(),
                &instr.node,
                format!("no kernel for {} operands", key.elem()),
            )
        })?;
        steps.push(Step {
            instr: instr.clone(),
            operands,
            kernel,
        });
    }

    let bindings = function
        .weights()
        .iter()
        .enumerate()
        .filter(|(_, w)| w.role != WeightRole::Constant)
        .map(|(index, w)| Binding {
            index,
            name: w.name.clone(),
            ty: w.ty.clone(),
            role: w.role,
        })
        .collect();
    let memory = Memory::new(function, poison)?;

    log::debug!(
        target: "nnaot::interp",
        "compiled `{}`: {} steps, {} arena bytes, poisoning {}",
        function.name(),
        steps.len(),
        function.memory().activation_bytes,
        if memory.is_poisoning() { "on" } else { "off" }
    );
    Ok(InterpretedFunction {
        mode,
        steps,
        bindings,
        memory,
    })
}

fn resolve(
    function: &IrFunction,
    instr: &Instruction,
    id: nnaot::ir::BufferId,
) -> BackendResult<Operand> {
    let buffer = function.buffer(id);
    let place = match function.location(id) {
        Some(Location::Weight(index)) => Place::Weight(index),
        Some(Location::Activation { offset }) => Place::Arena { offset },
        None => {
            return Err(BackendError::unsupported(
                BACKEND,
                instr.name(),
                &instr.node,
                format!("buffer `{}` has no storage", buffer.name),
            ))
        }
    };
    Ok(Operand {
        name: buffer.name.clone(),
        ty: buffer.ty.clone(),
        place,
    })
}

impl InterpretedFunction {
    fn bind_inputs(&mut self, io: &IoBindings) -> BackendResult<()> {
        // Statistics accumulate across runs, so they are read back in too.
        for binding in &self.bindings {
            if !matches!(binding.role, WeightRole::Input | WeightRole::Profile) {
                continue;
            }
            let tensor = io.require(&binding.name)?;
            if tensor.ty() != &binding.ty {
                return Err(BackendError::execution(format!(
                    "`{}` bound as {}, expected {}",
                    binding.name,
                    tensor.ty(),
                    binding.ty
                )));
            }
            self.memory
                .weight_bytes_mut(binding.index)?
                .copy_from_slice(&tensor.to_le_bytes());
        }
        Ok(())
    }

    fn collect_outputs(&self, io: &mut IoBindings) -> BackendResult<()> {
        for binding in self.bindings.iter().filter(|b| b.role.is_writable()) {
            let bytes = self.memory.weight_bytes(binding.index)?;
            let tensor = Tensor::from_le_bytes(binding.ty.clone(), bytes)
                .map_err(|err| BackendError::execution(err.to_string()))?;
            io.insert(binding.name.clone(), tensor);
        }
        Ok(())
    }
}

impl CompiledFunction for InterpretedFunction {
    fn kind(&self) -> BackendKind {
        BackendKind::Interpreter
    }

    fn mode(&self) -> CompilationMode {
        self.mode
    }

    fn execute(&mut self, io: &mut IoBindings) -> BackendResult<()> {
        self.bind_inputs(io)?;
        self.memory.reset_arena();
        for (pos, step) in self.steps.iter().enumerate() {
            (step.kernel)(step, &mut self.memory).map_err(|err| match err {
                BackendError::Execution { message } => BackendError::execution(format!(
                    "instruction {pos} `{}` (node `{}`): {message}",
                    step.instr.name(),
                    step.instr.node
                )),
                other => other,
            })?;
        }
        self.collect_outputs(io)
    }
}
