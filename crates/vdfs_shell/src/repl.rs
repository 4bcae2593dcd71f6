use std::io::{BufRead, Write};

use vdfs_lib::FileSystem;

/// Une una ruta relativa a la actual y la normaliza léxicamente
/// (resuelve "." y ".." sin tocar el disco).
fn path_join(base: &str, rel: &str) -> String {
    let mut parts: Vec<&str> = if rel.starts_with('/') {
        Vec::new()
    } else {
        base.split('/').filter(|c| !c.is_empty()).collect()
    };
    for comp in rel.split('/').filter(|c| !c.is_empty()) {
        match comp {
            "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parse_num(s: &str) -> Option<u64> {
    s.parse::<u64>().ok()
}

pub struct Repl {
    fs: FileSystem,
    cur_path: String,
}

impl Repl {
    pub fn new(fs: FileSystem) -> Self {
        Self {
            fs,
            cur_path: "/".to_string(),
        }
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        let stdin = std::io::stdin();
        let mut lines = stdin.lock().lines();

        loop {
            print!("{} >", self.cur_path);
            std::io::stdout().flush()?;

            let line = match lines.next() {
                Some(line) => line?,
                None => return Ok(()),
            };
            let args: Vec<&str> = line.split_whitespace().collect();
            if args.is_empty() {
                continue;
            }

            match args[0] {
                "help" => print_help(),
                "exit" => return Ok(()),
                "ls" => self.cmd_ls(&args),
                "df" => self.cmd_df(),
                "cd" => self.cmd_cd(&args),
                "mkdir" => self.cmd_mkdir(&args),
                "touch" => self.cmd_touch(&args),
                "rm" => self.cmd_rm(&args),
                "rmdir" => self.cmd_rmdir(&args),
                "cat" => self.cmd_cat(&args),
                "open" => self.cmd_open(&args),
                "close" => self.cmd_close(&args),
                "read" => self.cmd_read(&args),
                "write" => self.cmd_write(&args),
                "seek" => self.cmd_seek(&args),
                "format" => self.cmd_format(&mut lines)?,
                "mkdirn" => self.cmd_batch(&args, true),
                "touchn" => self.cmd_batch(&args, false),
                other => println!("Unknown command: {}", other),
            }
        }
    }

    fn cmd_ls(&mut self, args: &[&str]) {
        let path = match args.len() {
            1 => self.cur_path.clone(),
            2 => path_join(&self.cur_path, args[1]),
            _ => {
                println!("Usage: ls [path]");
                return;
            }
        };
        match self.fs.list_directory(&path) {
            Ok(entries) => {
                for e in entries {
                    println!("{:9} {:12} {}", e.inode_id, e.size, e.name);
                }
            }
            Err(e) => println!("ls: {}", e),
        }
    }

    fn cmd_df(&mut self) {
        let info = self.fs.disk_info();
        println!("Disk size      : {} GB", info.disk_size_gb);
        println!("Block size     : {} B", info.block_size);
        println!(
            "Blocks         : {} free / {} total",
            info.free_blocks, info.total_blocks
        );
        println!(
            "Inodes         : {} free / {} total",
            info.free_inodes, info.inodes_cnt
        );
    }

    fn cmd_cd(&mut self, args: &[&str]) {
        match args.len() {
            1 => self.cur_path = "/".to_string(),
            2 => {
                let new_path = path_join(&self.cur_path, args[1]);
                if self.fs.has_dir(&new_path) {
                    self.cur_path = new_path;
                } else {
                    println!("Directory not found: {}", new_path);
                }
            }
            _ => println!("Usage: cd <path>"),
        }
    }

    fn cmd_mkdir(&mut self, args: &[&str]) {
        if args.len() != 2 {
            println!("Usage: mkdir <name>");
            return;
        }
        let path = path_join(&self.cur_path, args[1]);
        if let Err(e) = self.fs.create_dir(&path) {
            println!("mkdir: {}", e);
        }
    }

    fn cmd_touch(&mut self, args: &[&str]) {
        if args.len() != 2 {
            println!("Usage: touch <name>");
            return;
        }
        let path = path_join(&self.cur_path, args[1]);
        if let Err(e) = self.fs.create_file(&path) {
            println!("touch: {}", e);
        }
    }

    fn cmd_rm(&mut self, args: &[&str]) {
        if args.len() != 2 {
            println!("Usage: rm <filename>");
            return;
        }
        let path = path_join(&self.cur_path, args[1]);
        match self.fs.remove_file(&path) {
            Ok(()) => println!("File removed: {}", args[1]),
            Err(e) => println!("Failed to remove file: {} ({})", args[1], e),
        }
    }

    fn cmd_rmdir(&mut self, args: &[&str]) {
        if args.len() != 2 {
            println!("Usage: rmdir <dirname>");
            return;
        }
        let path = path_join(&self.cur_path, args[1]);
        match self.fs.remove_dir(&path) {
            Ok(()) => println!("Directory removed: {}", args[1]),
            Err(e) => println!("Failed to remove directory: {} ({})", args[1], e),
        }
    }

    fn cmd_cat(&mut self, args: &[&str]) {
        if args.len() < 2 {
            println!("Usage: cat <filename>");
            return;
        }
        let path = path_join(&self.cur_path, args[1]);
        if !self.fs.has_file(&path) {
            println!("File not found: {}", path);
            return;
        }
        let fd = match self.fs.open(&path, 0) {
            Ok(fd) => fd,
            Err(e) => {
                println!("Failed to open file: {}", e);
                return;
            }
        };
        let mut buf = vec![0u8; 1024];
        loop {
            match self.fs.read(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let printable: String = buf[..n]
                        .iter()
                        .map(|&b| if b == 0 { '.' } else { b as char })
                        .collect();
                    print!("{}", printable);
                }
                Err(e) => {
                    println!("read: {}", e);
                    break;
                }
            }
        }
        println!();
        let _ = self.fs.close(fd);
    }

    fn cmd_open(&mut self, args: &[&str]) {
        if args.len() < 2 || args.len() > 3 {
            println!("Usage: open <filename> [offset]");
            return;
        }
        let path = path_join(&self.cur_path, args[1]);
        if !self.fs.has_file(&path) {
            println!("File not found: {}", path);
            return;
        }
        let offset = if args.len() == 3 {
            match parse_num(args[2]) {
                Some(off) => off,
                None => {
                    println!("Invalid offset: {}", args[2]);
                    return;
                }
            }
        } else {
            0
        };
        match self.fs.open(&path, offset) {
            Ok(fd) => println!("File Descriptor: {}", fd),
            Err(e) => println!("Failed to open file: {}", e),
        }
    }

    fn cmd_close(&mut self, args: &[&str]) {
        if args.len() != 2 {
            println!("Usage: close <fd>");
            return;
        }
        match parse_num(args[1]) {
            Some(fd) => {
                if let Err(e) = self.fs.close(fd) {
                    println!("close: {}", e);
                }
            }
            None => println!("Invalid FD."),
        }
    }

    fn cmd_read(&mut self, args: &[&str]) {
        if args.len() != 3 {
            println!("Usage: read <fd> <size>");
            return;
        }
        let (fd, size) = match (parse_num(args[1]), parse_num(args[2])) {
            (Some(fd), Some(size)) => (fd, size),
            _ => {
                println!("Invalid arguments.");
                return;
            }
        };
        let mut buf = vec![0u8; size as usize];
        match self.fs.read(fd, &mut buf) {
            Ok(0) => println!("(Empty or EOF)"),
            Ok(n) => {
                let printable: String = buf[..n]
                    .iter()
                    .map(|&b| if b == 0 { '.' } else { b as char })
                    .collect();
                println!("{}", printable);
            }
            Err(e) => println!("read: {}", e),
        }
    }

    fn cmd_write(&mut self, args: &[&str]) {
        if args.len() != 3 {
            println!("Usage: write <fd> <content_string>");
            return;
        }
        let fd = match parse_num(args[1]) {
            Some(fd) => fd,
            None => {
                println!("Invalid FD.");
                return;
            }
        };
        match self.fs.write(fd, args[2].as_bytes()) {
            Ok(()) => println!("Written {} bytes.", args[2].len()),
            Err(e) => println!("write: {}", e),
        }
    }

    fn cmd_seek(&mut self, args: &[&str]) {
        if args.len() != 3 {
            println!("Usage: seek <fd> <offset>");
            return;
        }
        match (parse_num(args[1]), parse_num(args[2])) {
            (Some(fd), Some(off)) => match self.fs.seek(fd, off) {
                Ok(()) => println!("Seeked FD {} to offset {}", fd, off),
                Err(e) => println!("seek: {}", e),
            },
            _ => println!("Invalid arguments."),
        }
    }

    fn cmd_format(
        &mut self,
        lines: &mut std::io::Lines<std::io::StdinLock<'_>>,
    ) -> anyhow::Result<()> {
        print!("Ejecutar formateo [Y/N]: ");
        std::io::stdout().flush()?;
        let answer = match lines.next() {
            Some(line) => line?,
            None => return Ok(()),
        };
        if answer.trim().eq_ignore_ascii_case("y") {
            self.cur_path = "/".to_string();
            match self.fs.format() {
                Ok(()) => println!("Disk formatted."),
                Err(e) => println!("format: {}", e),
            }
        }
        Ok(())
    }

    fn cmd_batch(&mut self, args: &[&str], dirs: bool) {
        let usage = if dirs {
            "Usage: mkdirn <name_prefix> <count>"
        } else {
            "Usage: touchn <name_prefix> <count>"
        };
        if args.len() != 3 {
            println!("{}", usage);
            return;
        }
        let n = match parse_num(args[2]) {
            Some(n) => n,
            None => {
                println!("Invalid number: {}", args[2]);
                return;
            }
        };
        let mut success = 0;
        for i in 0..n {
            let name = format!("{}{}", args[1], i);
            let path = path_join(&self.cur_path, &name);
            let result = if dirs {
                self.fs.create_dir(&path)
            } else {
                self.fs.create_file(&path)
            };
            match result {
                Ok(()) => success += 1,
                Err(e) => println!("Failed to create {}: {}", name, e),
            }
        }
        println!("Batch created {} entries.", success);
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  ls [path]               List directory contents");
    println!("  cd <path>               Change directory");
    println!("  mkdir <name>            Create directory");
    println!("  touch <name>            Create file");
    println!("  rm <name>               Remove file");
    println!("  rmdir <name>            Remove directory (must be empty)");
    println!("  cat <name>              Display file content");
    println!("  open <name> [offset]    Open file");
    println!("  close <fd>              Close file");
    println!("  read <fd> <size>        Read from file descriptor");
    println!("  write <fd> <content>    Write to file descriptor");
    println!("  seek <fd> <offset>      Seek to offset in file");
    println!("  df                      Show free-space info");
    println!("  format                  Format file system");
    println!("  mkdirn <prefix> <n>     Batch create directories");
    println!("  touchn <prefix> <n>     Batch create files");
    println!("  exit                    Exit the system");
    println!("  help                    Show this help message");
}
