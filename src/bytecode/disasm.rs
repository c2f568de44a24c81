use crate::bytecode::op::{Imm, Opcode, decode, instructions, read_i32, read_u32};
use crate::bytecode::{Code, Function};
use crate::lang::value::Value;
use std::collections::HashMap;
use std::fmt::Write;

/// Print disassembly of a function
pub fn print_function(function: &Function) {
    print!("{}", disassemble(function));
}

/// Disassemble every code object of `function`.
pub fn disassemble(function: &Function) -> String {
    let mut out = String::new();

    for (ci, code) in function.codes.iter().enumerate() {
        let label = if ci == 0 {
            "body".to_string()
        } else {
            format!("code[{}]", ci)
        };
        write_code_object(&mut out, function, &label, code);
    }

    out
}

fn write_code_object(out: &mut String, function: &Function, name: &str, code: &Code) {
    let src = function
        .sources
        .get(code.src)
        .map(|v| v.to_string())
        .unwrap_or_default();

    let _ = writeln!(out, "════════════════════════════════════════");
    let _ = writeln!(out, " {}  {}", name, src);
    let _ = writeln!(
        out,
        " {} instructions, stack {}, istack {}",
        code.instruction_count(),
        code.stack_length,
        code.istack_length
    );
    if !code.children.is_empty() {
        let _ = writeln!(out, " children {:?}", code.children);
    }
    let _ = writeln!(out, "════════════════════════════════════════");
    disassemble_code(out, function, code);
    let _ = writeln!(out);
}

/// Disassemble one instruction stream. Jump targets are marked with `►`.
pub fn disassemble_code(out: &mut String, function: &Function, code: &Code) {
    let jump_targets = collect_jump_targets(code);

    for item in instructions(&code.bytes) {
        let (pc, _) = match item {
            Ok(insn) => insn,
            Err(fault) => {
                let _ = writeln!(out, "  !! {}", fault);
                return;
            }
        };

        if jump_targets.contains(&pc) {
            let _ = writeln!(out, "      ┌──────────────────────────────────");
        }
        let marker = if jump_targets.contains(&pc) { "► " } else { "  " };
        let _ = writeln!(
            out,
            "{:04} {}{}",
            pc,
            marker,
            format_instruction(function, code, pc)
        );
    }
}

fn collect_jump_targets(code: &Code) -> Vec<usize> {
    let mut targets = Vec::new();

    for (pc, op) in instructions(&code.bytes).flatten() {
        if !op.is_jump() {
            continue;
        }
        let mut cursor = pc + 1;
        if let Ok(offset) = read_i32(&code.bytes, &mut cursor) {
            let target = (cursor as i64 + offset as i64) as usize;
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    targets
}

/// One instruction as `mnemonic operands ; comment`.
pub fn format_instruction(function: &Function, code: &Code, pc: usize) -> String {
    let op = match decode(&code.bytes, pc) {
        Ok(op) => op,
        Err(fault) => return format!("!! {}", fault),
    };

    let mut cursor = pc + 1;
    let mut operands = Vec::new();
    let mut comments = Vec::new();

    for imm in op.immediates() {
        let Ok(raw) = read_u32(&code.bytes, &mut cursor) else {
            return format!("{:<11} !! truncated", op.mnemonic());
        };
        match imm {
            Imm::Pool => {
                operands.push(raw.to_string());
                comments.push(format_constant(function.constants.get(raw)));
            }
            Imm::Child => {
                operands.push(raw.to_string());
                match code.children.get(raw as usize) {
                    Some(index) => comments.push(format!("code[{}]", index)),
                    None => comments.push("?".to_string()),
                }
            }
            Imm::Jump => {
                let offset = raw as i32;
                let target = cursor as i64 + offset as i64;
                let arrow = if offset < 0 { "↑" } else { "↓" };
                operands.push(format!("{:+}", offset));
                comments.push(format!("{} {:04}", arrow, target));
            }
            Imm::Int | Imm::Arg => operands.push((raw as i32).to_string()),
        }
    }

    let mut line = format!("{:<11} {}", op.mnemonic(), operands.join(", "));
    if !comments.is_empty() {
        line = format!("{:<24}; {}", line, comments.join(", "));
    }
    line.trim_end().to_string()
}

fn format_constant(value: Option<&Value>) -> String {
    match value {
        None => "?".to_string(),
        Some(Value::Null) => "NULL".to_string(),
        Some(Value::Code(_)) => "<bytecode>".to_string(),
        Some(v) => {
            let text = v.to_string();
            if text.chars().count() > 40 {
                let short: String = text.chars().take(37).collect();
                format!("{}...", short)
            } else {
                text
            }
        }
    }
}

/// Static opcode counts over all code objects, most frequent first.
pub fn opcode_counts(function: &Function) -> Vec<(Opcode, usize)> {
    let mut counts: HashMap<Opcode, usize> = HashMap::new();
    for code in &function.codes {
        for (_, op) in instructions(&code.bytes).flatten() {
            *counts.entry(op).or_insert(0) += 1;
        }
    }
    let mut counts: Vec<_> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then((a.0 as u8).cmp(&(b.0 as u8))));
    counts
}

pub fn print_function_stats(function: &Function) {
    let total: usize = function.codes.iter().map(|c| c.instruction_count()).sum();

    println!("=== BYTECODE STATS ===");
    println!("code objects:  {}", function.codes.len());
    println!("instructions:  {}", total);
    println!("constants:     {}", function.constants.len() - 1);
    println!("sources:       {}", function.sources.len() - 1);
    for (op, count) in opcode_counts(function) {
        println!("  {:<11} {}", op.mnemonic(), count);
    }
}
