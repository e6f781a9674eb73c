// rvm: a register-style virtual machine for the RA language.
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

use rvm::codec;
use rvm::config::{self, OutputTarget, RunConfig};
use rvm::engine::Vm;
use rvm::output::BufferedSink;
use rvm::parser;
use rvm::util::file_ext;

const USAGE: &str = "usage: rvm run <file.ra|file.rsi> [config.ron]\n\
                     \x20      rvm comp <file.ra> <out.rsi> [config.ron]\n\
                     \x20      rvm vs-check <file.rsi>\n\
                     \x20      rvm version\n";

fn load_config(position: usize) -> RunConfig {
    match args().nth(position) {
        Some(path) => config::load(&path).expect("couldn't load config"),
        None => RunConfig::default(),
    }
}

fn make_vm(config: RunConfig) -> Vm {
    let mut sink = BufferedSink::console();
    sink.set_threshold(config.buffer_threshold);
    if let OutputTarget::File(path) = &config.output {
        sink.redirect_to_file(path).expect("couldn't redirect output");
    }
    Vm::new(config, Box::new(sink))
}

fn run() {
    let target = args().nth(2).expect(USAGE);
    let config = load_config(3);
    let profile = config.profile;
    let mut vm = make_vm(config);
    vm.initialize(&target);
    let set = if file_ext(&target) == "rsi" {
        codec::load_archive(&mut vm, &target)
    } else {
        parser::parse_file(&mut vm, &target)
    };
    let set = match set {
        Ok(set) => set,
        Err(e) => {
            eprintln!("{}", e.render(profile));
            std::process::exit(1);
        }
    };
    if vm.run_root(&set).is_some() {
        std::process::exit(1);
    }
}

fn comp() {
    let target = args().nth(2).expect(USAGE);
    let archive = args().nth(3).expect(USAGE);
    let config = load_config(4);
    let profile = config.profile;
    let mut vm = make_vm(config);
    vm.initialize(&target);
    let result = parser::parse_file(&mut vm, &target)
        .and_then(|set| codec::save_archive(&archive, &set, profile, &vm.linked_modules));
    match result {
        Ok(()) => println!(
            "[RVM Msg] >> Compilation finished with [{}] profile.",
            profile.name()
        ),
        Err(e) => {
            eprintln!("{}", e.render(profile));
            std::process::exit(1);
        }
    }
}

fn vs_check() {
    let target = args().nth(2).expect(USAGE);
    match codec::read_archive_version(&target) {
        Ok(header) => println!("[RVM Msg] >> {}", header.version_info(&target)),
        Err(e) => {
            eprintln!(
                "[RVM Error] >> Failed to retrieve the version information from the target \
                 RSI file."
            );
            eprintln!("[RVM Error] >> {}", e);
            std::process::exit(1);
        }
    }
}

fn main() {
    match args().nth(1).as_deref() {
        Some("run") => run(),
        Some("comp") => comp(),
        Some("vs-check") => vs_check(),
        Some("version") => println!("[RVM Msg] >> {}", codec::Header::vm_version_info()),
        _ => print!("{}", USAGE),
    }
}
