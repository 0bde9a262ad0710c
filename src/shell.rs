//! Line-oriented shell over a [`NavigationEngine`].
//!
//! Paths are resolved against the working location; a leading `/` starts
//! from the drive root and `..` climbs one level.

use crate::{
    models::{ChildItem, Item, ObjectPath},
    services::navigation::{NavigationEngine, NewItemContent},
};
use anyhow::{Context, Result, bail};
use std::{fmt::Write as _, path::PathBuf, str::FromStr, sync::Arc};
use tokio_util::sync::CancellationToken;

pub const HELP: &str = "\
commands:
  ls [-r] [path]        list children (recursively with -r)
  cd [path]             change the working location
  pwd                   print the working location
  stat <path>           show metadata as JSON
  test <path>           report whether a path exists and is a container
  cat <path>            print an object's contents
  write <path> <text>   create or replace an object with text
  put <local> <path>    upload a local file
  mkdir <path>          create a folder marker
  mb <bucket>           create a bucket
  cp [-r] <src> <dst>   copy an object or folder
  rm [-r] <path>        remove an object, folder, or bucket
  clear <path>          truncate an object to zero bytes
  help                  show this text
  exit                  leave the shell";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ls { recursive: bool, path: Option<String> },
    Cd(Option<String>),
    Pwd,
    Stat(String),
    Test(String),
    Cat(String),
    Write { path: String, text: String },
    Put { local: PathBuf, path: String },
    Mkdir(String),
    Mb(String),
    Cp { recursive: bool, src: String, dst: String },
    Rm { recursive: bool, path: String },
    Clear(String),
    Help,
    Exit,
}

/// Split off a leading `-r` flag.
fn recursive_flag<'a>(args: &[&'a str]) -> (bool, Vec<&'a str>) {
    match args.split_first() {
        Some((&"-r", rest)) => (true, rest.to_vec()),
        _ => (false, args.to_vec()),
    }
}

fn one(name: &str, args: &[&str]) -> Result<String> {
    match args {
        [arg] => Ok(arg.to_string()),
        _ => bail!("usage: {name} <path>"),
    }
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim_start();
        let args: Vec<&str> = rest.split_whitespace().collect();

        Ok(match word {
            "ls" | "dir" => {
                let (recursive, args) = recursive_flag(&args);
                match args.as_slice() {
                    [] => Command::Ls {
                        recursive,
                        path: None,
                    },
                    [path] => Command::Ls {
                        recursive,
                        path: Some(path.to_string()),
                    },
                    _ => bail!("usage: ls [-r] [path]"),
                }
            }
            "cd" => match args.as_slice() {
                [] => Command::Cd(None),
                [path] => Command::Cd(Some(path.to_string())),
                _ => bail!("usage: cd [path]"),
            },
            "pwd" => Command::Pwd,
            "stat" => Command::Stat(one("stat", &args)?),
            "test" => Command::Test(one("test", &args)?),
            "cat" => Command::Cat(one("cat", &args)?),
            "write" => {
                let (path, text) = rest
                    .split_once(char::is_whitespace)
                    .context("usage: write <path> <text>")?;
                Command::Write {
                    path: path.to_string(),
                    text: text.trim_start().to_string(),
                }
            }
            "put" => match args.as_slice() {
                [local, path] => Command::Put {
                    local: PathBuf::from(local),
                    path: path.to_string(),
                },
                _ => bail!("usage: put <local> <path>"),
            },
            "mkdir" => Command::Mkdir(one("mkdir", &args)?),
            "mb" => Command::Mb(one("mb", &args)?),
            "cp" => {
                let (recursive, args) = recursive_flag(&args);
                match args.as_slice() {
                    [src, dst] => Command::Cp {
                        recursive,
                        src: src.to_string(),
                        dst: dst.to_string(),
                    },
                    _ => bail!("usage: cp [-r] <src> <dst>"),
                }
            }
            "rm" => {
                let (recursive, args) = recursive_flag(&args);
                match args.as_slice() {
                    [path] => Command::Rm {
                        recursive,
                        path: path.to_string(),
                    },
                    _ => bail!("usage: rm [-r] <path>"),
                }
            }
            "clear" => Command::Clear(one("clear", &args)?),
            "help" | "?" => Command::Help,
            "exit" | "quit" => Command::Exit,
            other => bail!("unknown command `{other}`; try `help`"),
        })
    }
}

/// Result of one command.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Output(String),
    Exit,
}

pub struct Shell {
    engine: Arc<NavigationEngine>,
    cwd: ObjectPath,
}

impl Shell {
    pub fn new(engine: Arc<NavigationEngine>) -> Self {
        Self {
            engine,
            cwd: ObjectPath::drive(),
        }
    }

    pub fn cwd(&self) -> &ObjectPath {
        &self.cwd
    }

    pub fn prompt(&self) -> String {
        format!("/{}> ", self.cwd.render())
    }

    /// Resolve `arg` against the working location.
    pub fn resolve(&self, arg: &str) -> ObjectPath {
        let absolute = arg.starts_with(['/', '\\']);
        let mut segments: Vec<String> = if absolute {
            Vec::new()
        } else {
            self.cwd
                .render()
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };
        for segment in arg.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                other => segments.push(other.to_string()),
            }
        }
        let mut joined = segments.join("/");
        if segments.len() > 1 && arg.ends_with(['/', '\\']) {
            joined.push('/');
        }
        ObjectPath::parse(&joined)
    }

    pub async fn execute(&mut self, command: Command, cancel: &CancellationToken) -> Result<Outcome> {
        let engine = self.engine.clone();
        let output = match command {
            Command::Exit => return Ok(Outcome::Exit),
            Command::Help => HELP.to_string(),
            Command::Pwd => format!("/{}", self.cwd.render()),
            Command::Cd(target) => {
                let target = match target {
                    Some(arg) => self.resolve(&arg),
                    None => ObjectPath::drive(),
                };
                if !engine.exists(&target, cancel).await?
                    || !engine.is_container(&target, cancel).await?
                {
                    bail!("`{target}` is not a folder");
                }
                self.cwd = match target.trimmed_name() {
                    Some(_) => target.as_folder(),
                    None => target,
                };
                String::new()
            }
            Command::Ls { recursive, path } => {
                let target = match path {
                    Some(arg) => self.resolve(&arg),
                    None => self.cwd.clone(),
                };
                let mut cursor = engine.child_items(&target, recursive, cancel).await?;
                let mut out = String::new();
                while let Some(child) = cursor.next().await? {
                    let _ = writeln!(out, "{}", format_child(&child));
                }
                out.trim_end().to_string()
            }
            Command::Stat(arg) => {
                let item = engine.get_item(&self.resolve(&arg), cancel).await?;
                serde_json::to_string_pretty(&item)?
            }
            Command::Test(arg) => {
                let path = self.resolve(&arg);
                let exists = engine.exists(&path, cancel).await?;
                let container = exists && engine.is_container(&path, cancel).await?;
                let children = container && engine.has_children(&path, cancel).await?;
                format!("exists: {exists}, container: {container}, children: {children}")
            }
            Command::Cat(arg) => {
                let reader = engine.open_reader(&self.resolve(&arg), cancel).await?;
                String::from_utf8_lossy(&reader.read_to_end().await?).into_owned()
            }
            Command::Write { path, text } => {
                let item = engine
                    .new_item(&self.resolve(&path), NewItemContent::Text(text), None, cancel)
                    .await?;
                describe_created(&item)
            }
            Command::Put { local, path } => {
                let item = engine
                    .new_item(&self.resolve(&path), NewItemContent::File(local), None, cancel)
                    .await?;
                describe_created(&item)
            }
            Command::Mkdir(arg) => {
                let item = engine
                    .new_item(&self.resolve(&arg), NewItemContent::Folder, None, cancel)
                    .await?;
                describe_created(&item)
            }
            Command::Mb(name) => {
                let item = engine
                    .new_item(&ObjectPath::bucket(name), NewItemContent::Folder, None, cancel)
                    .await?;
                describe_created(&item)
            }
            Command::Cp {
                recursive,
                src,
                dst,
            } => {
                engine
                    .copy_item(&self.resolve(&src), &self.resolve(&dst), recursive, cancel)
                    .await?;
                String::new()
            }
            Command::Rm { recursive, path } => {
                let target = self.resolve(&path);
                engine.remove_item(&target, recursive, cancel).await?;
                if self.cwd.render().starts_with(&target.render()) && target.bucket_name().is_some()
                {
                    self.cwd = target.parent();
                }
                String::new()
            }
            Command::Clear(arg) => {
                engine.clear_content(&self.resolve(&arg), cancel).await?;
                String::new()
            }
        };
        Ok(Outcome::Output(output))
    }
}

fn format_child(child: &ChildItem) -> String {
    match &child.item {
        Item::Drive => "/".to_string(),
        Item::Bucket(bucket) => format!("{:>12}  {}  {}/", "<bucket>", bucket.project, child.name),
        Item::Folder { .. } => format!("{:>12}  {}", "<dir>", child.name),
        Item::Object(object) => format!(
            "{:>12}  {}  {}",
            object.size,
            object.updated.format("%Y-%m-%d %H:%M"),
            child.name
        ),
    }
}

fn describe_created(item: &Item) -> String {
    match item {
        Item::Drive => String::new(),
        Item::Bucket(bucket) => format!("created bucket {}", bucket.name),
        Item::Folder { path, .. } => format!("created folder {path}"),
        Item::Object(object) => format!("wrote {} bytes to {}", object.size, object.path()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::NavigatorConfig, store::MemoryStore};

    fn shell() -> Shell {
        let store = Arc::new(MemoryStore::new());
        store.put_bucket("p", "b");
        store.put_object("b", "x.txt", "hello");
        store.put_object("b", "dir/y.txt", "y");
        Shell::new(Arc::new(NavigationEngine::new(
            store,
            NavigatorConfig::default(),
        )))
    }

    #[test]
    fn test_should_parse_commands() {
        assert_eq!(
            "ls -r b/dir".parse::<Command>().unwrap(),
            Command::Ls {
                recursive: true,
                path: Some("b/dir".into())
            }
        );
        assert_eq!(
            "write b/x.txt hello  world".parse::<Command>().unwrap(),
            Command::Write {
                path: "b/x.txt".into(),
                text: "hello  world".into()
            }
        );
        assert!("cp onlyone".parse::<Command>().is_err());
        assert!("frobnicate".parse::<Command>().is_err());
    }

    #[test]
    fn test_should_resolve_relative_paths() {
        let mut shell = shell();
        shell.cwd = ObjectPath::parse("b/dir/");
        assert_eq!(shell.resolve("y.txt"), ObjectPath::parse("b/dir/y.txt"));
        assert_eq!(shell.resolve(".."), ObjectPath::bucket("b"));
        assert_eq!(shell.resolve("../.."), ObjectPath::drive());
        assert_eq!(shell.resolve("/c/z"), ObjectPath::parse("c/z"));
        assert_eq!(shell.resolve("sub/"), ObjectPath::parse("b/dir/sub/"));
    }

    #[tokio::test]
    async fn test_should_navigate_and_list() {
        let mut shell = shell();
        let cancel = CancellationToken::new();
        shell
            .execute("cd b".parse().unwrap(), &cancel)
            .await
            .unwrap();
        assert_eq!(shell.prompt(), "/b> ");

        let Outcome::Output(listing) = shell.execute("ls".parse().unwrap(), &cancel).await.unwrap()
        else {
            panic!("expected output");
        };
        assert!(listing.contains("x.txt"));
        assert!(listing.contains("dir/"));

        let Outcome::Output(text) = shell
            .execute("cat x.txt".parse().unwrap(), &cancel)
            .await
            .unwrap()
        else {
            panic!("expected output");
        };
        assert_eq!(text, "hello");

        assert!(shell.execute("cd x.txt".parse().unwrap(), &cancel).await.is_err());
        assert_eq!(
            shell.execute("exit".parse().unwrap(), &cancel).await.unwrap(),
            Outcome::Exit
        );
    }
}
