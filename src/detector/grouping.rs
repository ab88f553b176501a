// 该文件是 Yeshi （夜视） 项目的一部分。
// src/detector/grouping.rs - 候选框聚类合并
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use super::BoundingBox;

fn similar(a: &BoundingBox, b: &BoundingBox, eps: f64) -> bool {
  let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
  let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
  close(a.x, b.x) && close(a.y, b.y) && close(a.right(), b.right()) && close(a.bottom(), b.bottom())
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
  while parent[i] != i {
    parent[i] = parent[parent[i]];
    i = parent[i];
  }
  i
}

/// 将相似矩形划分为等价类，返回每个矩形的类编号与类的数量。
/// 类编号按类中首个矩形出现的顺序分配。
fn partition(rects: &[BoundingBox], eps: f64) -> (Vec<usize>, usize) {
  let mut parent: Vec<usize> = (0..rects.len()).collect();
  for i in 0..rects.len() {
    for j in (i + 1)..rects.len() {
      if similar(&rects[i], &rects[j], eps) {
        let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
        if ri != rj {
          parent[rj] = ri;
        }
      }
    }
  }

  let mut class_of_root = vec![usize::MAX; rects.len()];
  let mut labels = Vec::with_capacity(rects.len());
  let mut classes = 0;
  for i in 0..rects.len() {
    let root = find(&mut parent, i);
    if class_of_root[root] == usize::MAX {
      class_of_root[root] = classes;
      classes += 1;
    }
    labels.push(class_of_root[root]);
  }
  (labels, classes)
}

/// 合并重叠的检测窗口。
///
/// 相似窗口聚为一类并取平均框；成员数不超过 `group_threshold` 的类被丢弃；
/// 完全落在成员更多的大框内部的小框也被丢弃。`group_threshold` 为 0 时原样返回。
pub fn group_rectangles(rects: Vec<BoundingBox>, group_threshold: u32, eps: f64) -> Vec<BoundingBox> {
  if group_threshold == 0 || rects.is_empty() {
    return rects;
  }

  let (labels, classes) = partition(&rects, eps);
  let mut sums = vec![[0u64; 4]; classes];
  let mut counts = vec![0u32; classes];
  for (rect, &class) in rects.iter().zip(&labels) {
    let sum = &mut sums[class];
    sum[0] += rect.x as u64;
    sum[1] += rect.y as u64;
    sum[2] += rect.width as u64;
    sum[3] += rect.height as u64;
    counts[class] += 1;
  }

  let averaged: Vec<BoundingBox> = sums
    .iter()
    .zip(&counts)
    .map(|(sum, &n)| {
      let avg = |v: u64| (v as f64 / n as f64).round() as u32;
      BoundingBox::new(avg(sum[0]), avg(sum[1]), avg(sum[2]), avg(sum[3]))
    })
    .collect();

  let mut grouped = Vec::new();
  for (i, r1) in averaged.iter().enumerate() {
    let n1 = counts[i];
    if n1 <= group_threshold {
      continue;
    }
    let swallowed = averaged.iter().enumerate().any(|(j, r2)| {
      let n2 = counts[j];
      if j == i || n2 <= group_threshold {
        return false;
      }
      let dx = (r2.width as f64 * eps).round() as i64;
      let dy = (r2.height as f64 * eps).round() as i64;
      let inside = r1.x as i64 >= r2.x as i64 - dx
        && r1.y as i64 >= r2.y as i64 - dy
        && r1.right() as i64 <= r2.right() as i64 + dx
        && r1.bottom() as i64 <= r2.bottom() as i64 + dy;
      inside && (n2 > n1.max(3) || n1 < 3)
    });
    if !swallowed {
      grouped.push(*r1);
    }
  }
  grouped
}
