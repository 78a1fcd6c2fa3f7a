//! Path parsing and resolution, and the create/remove/rename operations
//! that mutate the directory tree.

use log::info;

use crate::block::BlockSpace;
use crate::blockmap;
use crate::dirent;
use crate::error::{Error, Result};
use crate::inode::{Inode, InodeSpace, ROOT_INODE};
use crate::layout::{Layout, NAME_MAX};
use crate::open_table::OpenTable;

fn is_valid_component_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Splits `path` into its `/`-separated components, validating every
/// character and length along the way.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(path.to_string()));
    }
    let mut parts = Vec::new();
    for component in path.split('/').skip(1) {
        if component.is_empty() || component.len() > NAME_MAX {
            return Err(Error::InvalidPath(path.to_string()));
        }
        if !component.chars().all(is_valid_component_char) {
            return Err(Error::InvalidPath(path.to_string()));
        }
        parts.push(component);
    }
    if parts.is_empty() {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

/// Splits `path` into its parent directory path and leaf component name.
pub fn split_parent(path: &str) -> Result<(String, String)> {
    let parts = split_path(path)?;
    let leaf = parts.last().unwrap().to_string();
    let parent = if parts.len() == 1 {
        "/".to_string()
    } else {
        format!("/{}", parts[..parts.len() - 1].join("/"))
    };
    Ok((parent, leaf))
}

/// Walks `path` from the root. When `create_missing` is set, absent
/// components are created as directories, except the final component,
/// which is created as a regular file unless `create_leaf_dir` is set.
pub fn resolve(
    inodes: &InodeSpace,
    blocks: &BlockSpace,
    layout: &Layout,
    path: &str,
    create_missing: bool,
    create_leaf_dir: bool,
) -> Result<u32> {
    if path == "/" {
        return Ok(ROOT_INODE);
    }
    let parts = split_path(path)?;
    let mut current = ROOT_INODE;
    let last = parts.len() - 1;
    for (i, name) in parts.iter().enumerate() {
        let mut dir_inode = inodes.read(current)?;
        if !dir_inode.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        match dirent::find(blocks, layout, &dir_inode, name)? {
            Some(child) => current = child,
            None => {
                if !create_missing {
                    return Err(Error::NotFound(path.to_string()));
                }
                let is_dir = i != last || create_leaf_dir;
                let child_index = inodes.get()?;
                let child = Inode::empty(is_dir);
                inodes.write(child_index, &child)?;
                dirent::insert(blocks, layout, &mut dir_inode, name, child_index)?;
                inodes.write(current, &dir_inode)?;
                current = child_index;
            }
        }
    }
    Ok(current)
}

/// Creates `path` as a directory (`is_dir = true`) or regular file. If the
/// terminal component already exists, succeeds only when its kind matches.
pub fn create(inodes: &InodeSpace, blocks: &BlockSpace, layout: &Layout, path: &str, is_dir: bool) -> Result<u32> {
    let index = resolve(inodes, blocks, layout, path, true, is_dir)?;
    let inode = inodes.read(index)?;
    if inode.is_dir() != is_dir {
        return Err(if is_dir {
            Error::NotADirectory(path.to_string())
        } else {
            Error::IsADirectory(path.to_string())
        });
    }
    info!("created {path} (dir={is_dir})");
    Ok(index)
}

fn remove_subtree(
    inodes: &InodeSpace,
    blocks: &BlockSpace,
    layout: &Layout,
    open_table: &mut OpenTable,
    index: u32,
) -> Result<()> {
    let mut inode = inodes.read(index)?;
    if inode.is_dir() {
        let children = dirent::enumerate(blocks, layout, &inode)?;
        for child in children {
            remove_subtree(inodes, blocks, layout, open_table, child.inode_index)?;
        }
    }
    if open_table.is_open(index) {
        open_table.mark_defer_delete(index);
    } else {
        blockmap::release_all(blocks, layout, &mut inode)?;
        inodes.free(index)?;
    }
    Ok(())
}

/// Removes `path`. Directories require `recursive = true`. Inodes that are
/// currently open have their blocks released only at last close.
pub fn remove(
    inodes: &InodeSpace,
    blocks: &BlockSpace,
    layout: &Layout,
    open_table: &mut OpenTable,
    path: &str,
    recursive: bool,
) -> Result<()> {
    let (parent_path, leaf) = split_parent(path)?;
    let parent_index = resolve(inodes, blocks, layout, &parent_path, false, true)?;
    let mut parent = inodes.read(parent_index)?;
    let target = dirent::find(blocks, layout, &parent, &leaf)?.ok_or_else(|| Error::NotFound(path.to_string()))?;
    let target_inode = inodes.read(target)?;
    if target_inode.is_dir() && !recursive {
        return Err(Error::IsADirectory(path.to_string()));
    }
    remove_subtree(inodes, blocks, layout, open_table, target)?;
    dirent::remove(blocks, layout, &mut parent, &leaf)?;
    inodes.write(parent_index, &parent)?;
    info!("removed {path}");
    Ok(())
}

/// Moves the directory record for `old` to `new`, without touching the
/// referenced inode or its contents.
pub fn rename(inodes: &InodeSpace, blocks: &BlockSpace, layout: &Layout, old: &str, new: &str) -> Result<()> {
    let (old_parent_path, old_leaf) = split_parent(old)?;
    let (new_parent_path, new_leaf) = split_parent(new)?;

    let old_parent_index = resolve(inodes, blocks, layout, &old_parent_path, false, true)?;
    let mut old_parent = inodes.read(old_parent_index)?;
    let target = dirent::find(blocks, layout, &old_parent, &old_leaf)?.ok_or_else(|| Error::NotFound(old.to_string()))?;

    let new_parent_index = resolve(inodes, blocks, layout, &new_parent_path, true, true)?;
    let mut new_parent = inodes.read(new_parent_index)?;
    if dirent::find(blocks, layout, &new_parent, &new_leaf)?.is_some() {
        return Err(Error::InvalidPath(format!("{new} already exists")));
    }

    dirent::remove(blocks, layout, &mut old_parent, &old_leaf)?;
    inodes.write(old_parent_index, &old_parent)?;

    dirent::insert(blocks, layout, &mut new_parent, &new_leaf, target)?;
    inodes.write(new_parent_index, &new_parent)?;

    info!("renamed {old} to {new}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_rejects_bad_input() {
        assert!(split_path("no/leading/slash").is_err());
        assert!(split_path("/").is_err());
        assert!(split_path("/a//b").is_err());
        assert!(split_path("/bad name").is_err());
        assert!(split_path("/ok_name.txt").is_ok());
    }

    #[test]
    fn split_parent_handles_single_and_nested() {
        let (parent, leaf) = split_parent("/file").unwrap();
        assert_eq!(parent, "/");
        assert_eq!(leaf, "file");
        let (parent, leaf) = split_parent("/a/b/c").unwrap();
        assert_eq!(parent, "/a/b");
        assert_eq!(leaf, "c");
    }
}
