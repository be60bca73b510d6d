// stackvm: a typed stack-machine bytecode interpreter.
//
// Copyright (C) 2020  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

use std::env::args;

use stackvm::config::{self, VmConfig};
use stackvm::image::{ConstantPool, Function, Image, Instructions, Opcode};
use stackvm::types::Structures;
use stackvm::vm::{ExecResult, Interpreter};


// A small built-in program while the loader lives elsewhere:
// factorial of 10, computed recursively.
fn demo_image() -> Image {
    use Opcode::*;

    let fact = Function::new(
        0,
        1,
        true,
        Instructions::new(
            vec![
                Load(0),
                Push(0),
                ICmp,
                Jbe(0),
                Load(0),
                Load(0),
                Push(0),
                Sub,
                Call(0),
                Mul,
                Ret,
                Load(0),
                Ret,
            ],
            vec![11],
        ),
    );

    Image::new(
        "<demo:factorial>",
        ConstantPool::new(vec![1, 10], Vec::new(), Vec::new()),
        Structures::new(),
        vec![fact],
        Instructions::new(vec![Push(1), Call(0)], Vec::new()),
    )
}

fn main() {
    let config = if let Some(path) = args().nth(1) {
        config::load(&path).expect("couldn't load config")
    } else {
        VmConfig::default()
    };

    let image = demo_image();
    if config.trace {
        println!("{}", image.path());
        println!("{}", image.constant_pool());
        for index in 0..image.instructions().len() {
            if let Some(op) = image.instructions().get(index) {
                println!("{:?} {:?}", index, op);
            }
        }
    }

    let mut vm = Interpreter::new(image);
    vm.allocate_stack(config.stack_size);

    if vm.interpret() {
        match vm.get_result() {
            ExecResult::None => println!("no result"),
            ExecResult::Int(value) => println!("{}", value),
            ExecResult::Long(value) => println!("{}", value),
            ExecResult::Double(value) => println!("{}", value),
            ExecResult::Pointer(address) => println!("{:#x}", address),
            ExecResult::Structure(address) => println!("structure at {:#x}", address),
        }
    } else if let Some(exception) = vm.get_exception() {
        println!(
            "execution fault: {} at instruction {} (depth {})",
            exception.code, exception.instruction_index, exception.depth
        );
    }
}
