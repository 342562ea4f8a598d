//! Line-oriented shell over an open volume.
//!
//! Failed commands leave the prompt unchanged and print nothing, except when
//! a mutation was only partially applied.

use std::io::{self, BufRead, Read, Seek, Write};

use log::debug;

use crate::error::VolumeError;
use crate::fs::entry::FileEntry;
use crate::fs::tree::NodeId;
use crate::fs::Volume;

/// Whether the prompt loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Shell<D> {
    volume: Volume<D>,
    cwd: NodeId,
    long_listing: bool,
}

impl<D: Read + Write + Seek> Shell<D> {
    pub fn new(volume: Volume<D>) -> Self {
        let cwd = volume.root();
        Self {
            volume,
            cwd,
            long_listing: false,
        }
    }

    /// Make a bare `ls` produce the long format.
    pub fn with_long_listing(mut self, long_listing: bool) -> Self {
        self.long_listing = long_listing;
        self
    }

    pub fn pwd(&self) -> String {
        self.volume.absolute_path(self.cwd)
    }

    pub fn volume(&self) -> &Volume<D> {
        &self.volume
    }

    pub fn into_volume(self) -> Volume<D> {
        self.volume
    }

    /// Prompt, read and execute lines until `quit` or end of input.
    pub fn run<R: BufRead, W: Write, E: Write>(
        &mut self,
        mut input: R,
        out: &mut W,
        err: &mut E,
    ) -> io::Result<()> {
        let mut line = String::new();
        loop {
            write!(out, "{}> ", self.pwd())?;
            out.flush()?;
            line.clear();
            if input.read_line(&mut line)? == 0 {
                writeln!(out)?;
                return Ok(());
            }
            if self.execute(&line, out, err)? == Flow::Quit {
                return Ok(());
            }
        }
    }

    /// Execute one command line.
    pub fn execute<W: Write, E: Write>(
        &mut self,
        line: &str,
        out: &mut W,
        err: &mut E,
    ) -> io::Result<Flow> {
        let args: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = args.split_first() else {
            return Ok(Flow::Continue);
        };

        let result = match (command, args) {
            ("quit" | "exit", _) => return Ok(Flow::Quit),
            ("pwd", _) => {
                writeln!(out, "{}", self.pwd())?;
                Ok(())
            }
            ("cd", [path, ..]) => self.change_dir(path),
            ("ls", ["-l", rest @ ..]) => self.list(rest.first().copied(), true, out)?,
            ("ls", rest) => self.list(rest.first().copied(), self.long_listing, out)?,
            ("mkdir", [path, ..]) => self.volume.create_directory(self.cwd, path).map(|_| ()),
            ("touch", [path, ..]) => self.volume.create_file(self.cwd, path).map(|_| ()),
            ("mv", [source, destination, ..]) => {
                self.volume.move_entry(self.cwd, source, destination)
            }
            ("cat", [path, ..]) => match self.volume.read_file(self.cwd, path) {
                Ok(data) => {
                    out.write_all(&data)?;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            _ => {
                debug!("ignored command line {:?}", line.trim_end());
                Ok(())
            }
        };

        if let Err(e) = result {
            if e.is_partial() {
                writeln!(err, "{command}: {e}")?;
            } else {
                debug!("{command} failed: {e}");
            }
        }
        Ok(Flow::Continue)
    }

    fn change_dir(&mut self, path: &str) -> Result<(), VolumeError> {
        let target = self.volume.resolve(self.cwd, path)?;
        let target = self.volume.tree().target_of(target);
        if !self.volume.node(target).is_directory() {
            return Err(VolumeError::InvalidOperation(format!("{path} is not a directory")));
        }
        self.cwd = target;
        Ok(())
    }

    /// Returns the volume error (if any) so the caller can report it; I/O
    /// errors on `out` propagate.
    fn list<W: Write>(
        &self,
        path: Option<&str>,
        long: bool,
        out: &mut W,
    ) -> io::Result<Result<(), VolumeError>> {
        let target = match path {
            Some(path) => match self.volume.resolve(self.cwd, path) {
                Ok(id) => self.volume.tree().target_of(id),
                Err(e) => return Ok(Err(e)),
            },
            None => self.cwd,
        };
        let entries = if self.volume.node(target).is_directory() {
            match self.volume.list_children(target) {
                Ok(entries) => entries,
                Err(e) => return Ok(Err(e)),
            }
        } else {
            vec![self.volume.entry(target)]
        };

        if long {
            for entry in &entries {
                writeln!(out, "{}", long_format(entry))?;
            }
        } else {
            let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
            writeln!(out, "{}", names.join(" "))?;
        }
        Ok(Ok(()))
    }
}

/// `drwx------ 1 root root 0 2024 Jan 5 13:07 name`
fn long_format(entry: &FileEntry) -> String {
    let (mode, size) = if entry.is_directory() {
        ("drwx------", 0)
    } else {
        ("-rwx------", entry.size)
    };
    let when = match entry.modified.to_datetime() {
        Some(dt) => dt.format("%Y %b %-d %H:%M").to_string(),
        None => format!(
            "{} {} {} {:02}:{:02}",
            entry.modified.year(),
            entry.modified.month(),
            entry.modified.day(),
            entry.modified.hour(),
            entry.modified.minute()
        ),
    };
    format!("{mode} 1 root root {size} {when} {}", entry.name)
}
