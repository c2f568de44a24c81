use crate::bytecode::ir::{Code, CodeIndex, Function, MISSING_ARG};
use crate::bytecode::op::{Imm, Opcode, decode, instructions, read_i32, read_u32};
use crate::lang::value::{Value, Vector};
use thiserror::Error;

/// Largest stack depth a code object may declare.
pub const MAX_DECLARED_DEPTH: u32 = 1 << 16;

#[derive(Debug, Error)]
#[error("verify error in code[{code}]: {message}")]
pub struct VerifyError {
    pub code: CodeIndex,
    pub message: String,
}

impl VerifyError {
    fn new(code: CodeIndex, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Structural checks on every code object of `function`, and of every
/// function nested in its constant pool.
pub fn verify_function(function: &Function) -> Result<(), VerifyError> {
    if function.codes.is_empty() {
        return Err(VerifyError::new(0, "function has no body"));
    }
    for index in 0..function.codes.len() {
        verify_code(function, index as CodeIndex)?;
    }
    for (k, constant) in function.constants.iter() {
        if let Value::Code(nested) = constant {
            verify_function(nested).map_err(|e| VerifyError {
                code: e.code,
                message: format!("in constant {}: {}", k, e.message),
            })?;
        }
    }
    Ok(())
}

/// Check one code object: decodability, immediate ranges, jump targets,
/// call-site constants, source map, declared stack sizes and stack
/// underflow.
pub fn verify_code(function: &Function, index: CodeIndex) -> Result<(), VerifyError> {
    let err = |message: String| VerifyError::new(index, message);
    let code = function
        .code(index)
        .ok_or_else(|| err("no such code".to_string()))?;

    if code.bytes.is_empty() {
        return Err(err("empty instruction stream".to_string()));
    }

    let mut boundaries = Vec::new();
    for item in instructions(&code.bytes) {
        let (pc, _) = item.map_err(|fault| err(fault.to_string()))?;
        boundaries.push(pc);
    }

    if boundaries.len() != code.src_map.len() {
        return Err(err(format!(
            "source map has {} entries for {} instructions",
            code.src_map.len(),
            boundaries.len()
        )));
    }
    let sources = function.sources.len();
    if code.src as usize >= sources {
        return Err(err(format!("unit source slot {} out of range", code.src)));
    }
    if let Some(slot) = code.src_map.iter().find(|s| **s as usize >= sources) {
        return Err(err(format!("source slot {} out of range", slot)));
    }
    if let Some(child) = code
        .children
        .iter()
        .find(|c| **c as usize >= function.codes.len())
    {
        return Err(err(format!("child code index {} out of range", child)));
    }

    for &pc in &boundaries {
        check_instruction(function, code, pc, &boundaries).map_err(err)?;
    }

    let last = boundaries.last().copied().unwrap_or(0);
    match decode(&code.bytes, last) {
        Ok(Opcode::Ret) | Ok(Opcode::Br) => {}
        _ => return Err(err("code does not end in ret or br".to_string())),
    }

    check_stack(code).map_err(err)?;
    check_declared_depths(code).map_err(err)
}

/// The interpreter reserves the declared sizes on frame entry, so they must
/// cover the computed depths and stay within [`MAX_DECLARED_DEPTH`].
fn check_declared_depths(code: &Code) -> Result<(), String> {
    let (stack, istack) = max_depths(code);
    for (name, declared, needed) in [
        ("operand", code.stack_length, stack),
        ("integer", code.istack_length, istack),
    ] {
        if (declared as usize) < needed {
            return Err(format!(
                "declared {} stack length {} is below the computed {}",
                name, declared, needed
            ));
        }
        if declared > MAX_DECLARED_DEPTH {
            return Err(format!(
                "declared {} stack length {} exceeds {}",
                name, declared, MAX_DECLARED_DEPTH
            ));
        }
    }
    Ok(())
}

fn check_instruction(
    function: &Function,
    code: &Code,
    pc: usize,
    boundaries: &[usize],
) -> Result<(), String> {
    let op = decode(&code.bytes, pc).map_err(|f| f.to_string())?;
    let mut cursor = pc + 1;
    let mut pool_immediates = Vec::new();

    for imm in op.immediates() {
        match imm {
            Imm::Pool => {
                let k = read_u32(&code.bytes, &mut cursor).map_err(|f| f.to_string())?;
                if k as usize >= function.constants.len() {
                    return Err(format!(
                        "{} at pc={}: constant {} out of range",
                        op, pc, k
                    ));
                }
                pool_immediates.push(k);
            }
            Imm::Child => {
                let offset = read_u32(&code.bytes, &mut cursor).map_err(|f| f.to_string())?;
                code.child(offset).map_err(|f| format!("{} at pc={}: {}", op, pc, f))?;
            }
            Imm::Jump => {
                let offset = read_i32(&code.bytes, &mut cursor).map_err(|f| f.to_string())?;
                let target = (pc + op.size()) as i64 + offset as i64;
                if target < 0 || boundaries.binary_search(&(target as usize)).is_err() {
                    return Err(format!(
                        "{} at pc={}: target {} is not an instruction boundary",
                        op, pc, target
                    ));
                }
            }
            Imm::Int | Imm::Arg => {
                read_u32(&code.bytes, &mut cursor).map_err(|f| f.to_string())?;
            }
        }
    }

    match op {
        Opcode::Ldfun | Opcode::Ldvar | Opcode::Ldddvar | Opcode::Isspecial => {
            let sym = function.constants.get(pool_immediates[0]);
            if !matches!(sym, Some(Value::Symbol(_))) {
                return Err(format!("{} at pc={}: operand is not a symbol", op, pc));
            }
        }
        Opcode::Call => check_call_site(function, code, pc, &pool_immediates)?,
        _ => {}
    }
    Ok(())
}

fn check_call_site(
    function: &Function,
    code: &Code,
    pc: usize,
    pool_immediates: &[u32],
) -> Result<(), String> {
    let args = match function.constants.get(pool_immediates[0]).and_then(Value::as_vector) {
        Some(Vector::Integer(args)) => args,
        _ => return Err(format!("call at pc={}: argument offsets are not integers", pc)),
    };
    for offset in args {
        match offset {
            Some(MISSING_ARG) => {}
            Some(n) if *n >= 0 && (*n as usize) < code.children.len() => {}
            _ => {
                return Err(format!(
                    "call at pc={}: argument offset {:?} out of range",
                    pc, offset
                ));
            }
        }
    }
    match function.constants.get(pool_immediates[1]) {
        Some(Value::Null) => Ok(()),
        Some(Value::Data(d)) => match d.vector() {
            Vector::Str(names) if names.len() == args.len() => Ok(()),
            _ => Err(format!("call at pc={}: names do not match arguments", pc)),
        },
        _ => Err(format!("call at pc={}: names are not a string vector", pc)),
    }
}

/// Linear stack-underflow scan from an empty stack.
///
/// Jumps are not followed, so this only catches straight-line mistakes.
fn check_stack(code: &Code) -> Result<(), String> {
    let (mut depth, mut idepth) = (0i64, 0i64);
    for item in instructions(&code.bytes) {
        let (pc, op) = item.map_err(|f| f.to_string())?;
        let effect = op.effect();
        depth -= effect.pop as i64;
        idepth -= effect.ipop as i64;
        if depth < 0 {
            return Err(format!(
                "stack underflow at pc={}, op={}, needed {} items",
                pc, op, effect.pop
            ));
        }
        if idepth < 0 {
            return Err(format!(
                "integer stack underflow at pc={}, op={}, needed {} items",
                pc, op, effect.ipop
            ));
        }
        depth += effect.push as i64;
        idepth += effect.ipush as i64;
    }
    Ok(())
}

/// Upper bounds for both stacks from a linear scan, `(operand, integer)`.
pub fn max_depths(code: &Code) -> (usize, usize) {
    let (mut depth, mut idepth, mut max, mut imax) = (0i64, 0i64, 0i64, 0i64);
    for (_, op) in instructions(&code.bytes).flatten() {
        let effect = op.effect();
        depth = (depth - effect.pop as i64).max(0) + effect.push as i64;
        idepth = (idepth - effect.ipop as i64).max(0) + effect.ipush as i64;
        max = max.max(depth);
        imax = imax.max(idepth);
    }
    (max as usize, imax as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::stream::{CodeStream, FunctionBuilder};

    fn single(build: impl FnOnce(&mut FunctionBuilder, &mut CodeStream)) -> Function {
        let mut fb = FunctionBuilder::new();
        let mut cs = CodeStream::new(0);
        build(&mut fb, &mut cs);
        fb.install(0, cs.finish().unwrap());
        fb.finish().unwrap()
    }

    #[test]
    fn test_valid_function_passes() {
        let f = single(|fb, cs| {
            let k = fb.constant(Value::real(1.0));
            cs.push(k).ret();
        });
        assert!(verify_function(&f).is_ok());
    }

    #[test]
    fn test_rejects_constant_out_of_range() {
        let f = single(|_, cs| {
            cs.push(42).ret();
        });
        let e = verify_function(&f).unwrap_err();
        assert!(e.message.contains("constant 42 out of range"), "{}", e);
    }

    #[test]
    fn test_rejects_misaligned_jump() {
        let mut f = single(|fb, cs| {
            let k = fb.constant(Value::logical(true));
            let end = cs.new_label();
            cs.push(k).brtrue(end);
            cs.bind(end).unwrap();
            cs.push(k).ret();
        });
        // push@0 brtrue@5 push@10 ret@15: retarget brtrue to pc 12
        f.codes[0].bytes[6..10].copy_from_slice(&2i32.to_le_bytes());
        let e = verify_function(&f).unwrap_err();
        assert!(e.message.contains("not an instruction boundary"), "{}", e);
    }

    #[test]
    fn test_rejects_non_symbol_lookup() {
        let f = single(|fb, cs| {
            let k = fb.constant(Value::real(1.0));
            cs.ldvar(k).ret();
        });
        assert!(verify_function(&f).is_err());
    }

    #[test]
    fn test_rejects_missing_ret() {
        let f = single(|fb, cs| {
            let k = fb.constant(Value::real(1.0));
            cs.push(k).op(Opcode::Pop);
        });
        let e = verify_function(&f).unwrap_err();
        assert!(e.message.contains("does not end"), "{}", e);
    }

    #[test]
    fn test_rejects_underflow() {
        let f = single(|_, cs| {
            cs.op(Opcode::Add).ret();
        });
        let e = verify_function(&f).unwrap_err();
        assert!(e.message.contains("stack underflow"), "{}", e);
    }

    #[test]
    fn test_rejects_call_offset_out_of_range() {
        let f = single(|fb, cs| {
            let fun = fb.symbol("f");
            let (args, names) = fb.call_consts(&[(None, 3)]);
            cs.ldfun(fun).call(args, names).ret();
        });
        let e = verify_function(&f).unwrap_err();
        assert!(e.message.contains("argument offset"), "{}", e);
    }

    #[test]
    fn test_rejects_oversized_declared_depth() {
        let mut f = single(|fb, cs| {
            let k = fb.constant(Value::real(1.0));
            cs.push(k).ret();
        });
        f.codes[0].istack_length = u32::MAX;
        let f = Function::from_bytes(&f.to_bytes().unwrap()).unwrap();
        let e = verify_function(&f).unwrap_err();
        assert!(e.message.contains("declared integer stack length"), "{}", e);
    }

    #[test]
    fn test_rejects_understated_declared_depth() {
        let mut f = single(|fb, cs| {
            let k = fb.constant(Value::real(1.0));
            cs.push(k).push(k).op(Opcode::Pop).ret();
        });
        f.codes[0].stack_length = 1;
        let e = verify_function(&f).unwrap_err();
        assert!(e.message.contains("below the computed 2"), "{}", e);
    }

    #[test]
    fn test_checks_nested_functions() {
        let mut nested = single(|fb, cs| {
            let k = fb.constant(Value::real(1.0));
            cs.push(k).ret();
        });
        nested.codes[0].stack_length = u32::MAX;
        let nested = std::rc::Rc::new(nested);

        let f = single(|fb, cs| {
            let k = fb.constant(Value::Code(nested.clone()));
            cs.push(k).ret();
        });
        let e = verify_function(&f).unwrap_err();
        assert!(e.message.starts_with("in constant 1:"), "{}", e);
        assert!(e.message.contains("declared operand stack length"), "{}", e);
    }

    #[test]
    fn test_max_depths() {
        let f = single(|fb, cs| {
            let k = fb.constant(Value::real(1.0));
            cs.push(k).push(k).push(k).op(Opcode::Pop).op(Opcode::Pop).ret();
        });
        assert_eq!(max_depths(&f.codes[0]), (3, 0));
    }
}
