use std::{env, fs, rc::Rc};

use thunkvm::bytecode::disasm::{print_function, print_function_stats};
use thunkvm::bytecode::verify::verify_function;
use thunkvm::{Function, StdHost, Vm, VmConfig, demo};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

struct Options {
    disasm: bool,
    verify_only: bool,
    no_run: bool,
    stats: bool,
    demo: Option<String>,
    emit: Option<String>,
    max_steps: Option<usize>,
    filename: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() == 1 || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    let options = parse_options(&args);

    let function = match (&options.demo, &options.filename) {
        (Some(name), _) => build_demo(name),
        (None, Some(filename)) => load_image(filename),
        (None, None) => {
            print_usage();
            std::process::exit(1);
        }
    };

    if let Some(path) = &options.emit {
        emit_image(&function, path);
    }

    if let Err(e) = verify_function(&function) {
        error!("{}", e);
        eprintln!("Verify error: {}", e);
        std::process::exit(1);
    }
    if options.verify_only {
        println!("ok");
        return;
    }

    if options.disasm {
        print_function(&function);
    }
    if options.no_run {
        return;
    }

    run_function(function, &options);
}

fn parse_options(args: &[String]) -> Options {
    let mut options = Options {
        disasm: false,
        verify_only: false,
        no_run: false,
        stats: false,
        demo: None,
        emit: None,
        max_steps: None,
        filename: None,
    };

    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--disasm" | "-d" => options.disasm = true,
            "--verify" => options.verify_only = true,
            "--no-run" => options.no_run = true,
            "--stats" => options.stats = true,
            "--demo" => options.demo = Some(expect_value(rest.next(), "--demo")),
            "--emit" => options.emit = Some(expect_value(rest.next(), "--emit")),
            "--max-steps" => {
                let value = expect_value(rest.next(), "--max-steps");
                match value.parse() {
                    Ok(n) => options.max_steps = Some(n),
                    Err(_) => {
                        eprintln!("Error: --max-steps expects a number, got '{}'", value);
                        std::process::exit(1);
                    }
                }
            }
            flag if flag.starts_with('-') => {
                eprintln!("Error: unknown option {}", flag);
                std::process::exit(1);
            }
            // first non-flag argument is the image file
            file => {
                if options.filename.is_none() {
                    options.filename = Some(file.to_string());
                }
            }
        }
    }
    options
}

fn expect_value(value: Option<&String>, flag: &str) -> String {
    match value {
        Some(v) => v.clone(),
        None => {
            eprintln!("Error: {} needs a value", flag);
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!("THUNKVM - bytecode interpreter for a lazily evaluated language");
    println!();
    println!("Usage:");
    println!("  thunkvm <image>               Verify and run a bytecode image");
    println!("  thunkvm --demo <name>         Run a built-in demo program");
    println!("  thunkvm --disasm, -d          Print the disassembly before running");
    println!("  thunkvm --verify              Only verify the image");
    println!("  thunkvm --no-run              Stop after verifying / disassembling");
    println!("  thunkvm --emit <path>         Write the program as a bytecode image");
    println!("  thunkvm --max-steps <n>       Abort after n instructions");
    println!("  thunkvm --stats               Print execution counters");
    println!("  thunkvm --help, -h            Show this help");
    println!();
    println!("Demos:");
    for demo in demo::DEMOS {
        println!("  {:<12} {}", demo.name, demo.description);
    }
}

fn build_demo(name: &str) -> Function {
    let Some(demo) = demo::by_name(name) else {
        let known: Vec<&str> = demo::names().collect();
        eprintln!("Error: unknown demo '{}' (known: {})", name, known.join(", "));
        std::process::exit(1);
    };
    match demo.build() {
        Ok(function) => function,
        Err(e) => {
            eprintln!("Assemble error: {}", e);
            std::process::exit(1);
        }
    }
}

fn load_image(filename: &str) -> Function {
    let bytes = match fs::read(filename) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", filename, e);
            std::process::exit(1);
        }
    };
    match Function::from_bytes(&bytes) {
        Ok(function) => {
            info!("loaded {} ({} code objects)", filename, function.codes.len());
            function
        }
        Err(e) => {
            eprintln!("Failed to load '{}': {}", filename, e);
            std::process::exit(1);
        }
    }
}

fn emit_image(function: &Function, path: &str) {
    let bytes = match function.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Failed to encode image: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = fs::write(path, &bytes) {
        eprintln!("Failed to write '{}': {}", path, e);
        std::process::exit(1);
    }
    info!("wrote {} bytes to {}", bytes.len(), path);
}

fn run_function(function: Function, options: &Options) {
    let function = Rc::new(function);
    let mut host = StdHost::new();
    let env = host.base_env();
    let mut vm = Vm::with_config(VmConfig {
        max_steps: options.max_steps,
        ..VmConfig::default()
    });

    let result = vm.run(&mut host, &function, &env);

    for warning in host.take_warnings() {
        eprintln!("Warning message:\n{}", warning);
    }

    match result {
        Ok(value) => {
            if vm.visible() {
                println!("{}", value);
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }

    if options.stats {
        let stats = vm.stats();
        println!();
        println!("=== EXECUTION STATS ===");
        println!("instructions:        {}", stats.instructions);
        println!("calls:               {}", stats.calls);
        println!("jumps:               {}", stats.jumps);
        println!("branches taken:      {}", stats.branches_taken);
        println!("branches not taken:  {}", stats.branches_not_taken);
        println!("promises forced:     {}", stats.promises_forced);
        print_function_stats(&function);
    }
}
