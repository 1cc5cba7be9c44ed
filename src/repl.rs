// File: src/repl.rs
//
// Interactive read-eval-print loop: multi-line input while braces stay
// unbalanced, a handful of `:`-prefixed commands, persistent history,
// and auto-printing of a trailing bare expression statement.

use crate::builtins;
use crate::config::Config;
use crate::vm::{InterpretError, Vm};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
    config: Config,
}

impl Repl {
    pub fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let mut editor = DefaultEditor::new()?;
        if let Some(path) = &config.history_file {
            let _ = editor.load_history(path);
        }
        let mut vm = Vm::new();
        vm.heap.stress_gc = config.gc_stress;
        builtins::install(&mut vm);
        Ok(Repl { vm, editor, config })
    }

    fn show_banner(&self) {
        println!("{}", "loxvm REPL".bright_cyan().bold());
        println!(
            "Type {} for commands, {} to leave.",
            ":help".bright_yellow(),
            ":quit".bright_yellow()
        );
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();
        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() { "> " } else { "..> " };
            match self.editor.readline(prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim_start().starts_with(':') {
                        if !self.handle_command(line.trim()) {
                            break;
                        }
                        continue;
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_balanced(&buffer) {
                        let source = prepare_source(&buffer);
                        self.eval(&source);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "Goodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {err}", "Error:".bright_red());
                    break;
                }
            }
        }

        if let Some(path) = &self.config.history_file {
            let _ = self.editor.save_history(path);
        }
        Ok(())
    }

    /// Returns `false` to end the REPL loop.
    fn handle_command(&mut self, cmd: &str) -> bool {
        match cmd {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":clear" | ":c" => {
                print!("\x1B[2J\x1B[1;1H");
                self.show_banner();
                true
            }
            _ => {
                println!("{} unknown command {cmd}. Try :help.", "Error:".bright_red());
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!(":help, :h    show this message");
        println!(":quit, :q    leave the REPL");
        println!(":clear, :c   clear the screen");
        println!();
        println!("A line with unbalanced braces continues on the next line.");
        println!("A bare expression (no trailing ';') prints its value.");
        println!();
    }

    fn eval(&mut self, source: &str) {
        if source.trim().is_empty() {
            return;
        }
        if let Err(err) = self.vm.interpret(source) {
            match err {
                InterpretError::Compile(errors) => {
                    for error in &errors {
                        eprintln!("{}", error.to_string().red());
                    }
                }
                InterpretError::Runtime(error) => {
                    eprint!("{}", error.to_string().red());
                }
            }
        }
    }
}

/// True once every brace/bracket/paren opened in `input` has been
/// closed and no string literal is left open. Lines inside an unclosed
/// delimiter keep the REPL in multi-line mode.
fn is_balanced(input: &str) -> bool {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_string {
            match ch {
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '{' | '(' | '[' => depth += 1,
            '}' | ')' | ']' => depth -= 1,
            _ => {}
        }
    }
    !in_string && depth <= 0
}

/// Implements the "auto-print the trailing bare expression" REPL
/// behavior by rewriting the input into a `print` statement when it
/// isn't already terminated as one (option (a) of the two the core
/// design leaves open).
fn prepare_source(input: &str) -> String {
    let trimmed = input.trim();
    match trimmed.chars().last() {
        Some(';') | Some('}') | None => input.to_string(),
        _ => format!("print ({trimmed});\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbalanced_braces_keep_input_open() {
        assert!(!is_balanced("fun f() {\n"));
        assert!(is_balanced("fun f() {\n  return 1;\n}\n"));
    }

    #[test]
    fn brace_inside_string_literal_does_not_count() {
        assert!(is_balanced("print \"{\";\n"));
    }

    #[test]
    fn bare_expression_is_rewritten_as_a_print_statement() {
        assert_eq!(prepare_source("1 + 2"), "print (1 + 2);\n");
    }

    #[test]
    fn statement_with_trailing_semicolon_is_left_untouched() {
        assert_eq!(prepare_source("var x = 1;"), "var x = 1;");
    }
}
